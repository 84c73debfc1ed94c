//! Backend id and location suffix allocation

use crate::error::BackendError;
use crate::record::{LocationKey, SUFFIX_MAX, SUFFIX_MIN};
use crate::registry::Registry;
use rand::Rng;
use tracing::{debug, warn};

/// Number of decimal digits in a backend id
pub const ID_DIGITS: u32 = 10;

/// Draws before giving up on finding a free id
const MAX_ID_ATTEMPTS: usize = 32;

/// Random id with exactly [`ID_DIGITS`] digits (never a leading zero)
pub fn random_id<R: Rng + ?Sized>(rng: &mut R) -> u64 {
    let low = 10u64.pow(ID_DIGITS - 1);
    let high = 10u64.pow(ID_DIGITS);
    rng.gen_range(low..high)
}

/// Draw ids until one is not `taken`
pub fn allocate_id_with<R, F>(rng: &mut R, taken: F) -> Result<u64, BackendError>
where
    R: Rng + ?Sized,
    F: Fn(u64) -> bool,
{
    for attempt in 1..=MAX_ID_ATTEMPTS {
        let id = random_id(rng);
        if !taken(id) {
            return Ok(id);
        }
        debug!(id, attempt, "Generated backend id already in use, drawing again");
    }
    Err(BackendError::Conflict(format!(
        "Could not find a free backend id after {} attempts",
        MAX_ID_ATTEMPTS
    )))
}

/// Fresh backend id not present in the registry
pub fn allocate_id(registry: &Registry) -> Result<u64, BackendError> {
    allocate_id_with(&mut rand::thread_rng(), |id| registry.contains_id(id))
}

/// Next suffix for `prefix` given the location keys in use.
///
/// `100` when the prefix is unused, otherwise one past the highest suffix.
/// Suffixes never wrap: once the highest reaches 999 the prefix is full.
pub fn next_suffix<'a, I>(prefix: &str, keys: I) -> Result<u16, BackendError>
where
    I: IntoIterator<Item = &'a LocationKey>,
{
    let highest = keys
        .into_iter()
        .filter(|key| key.prefix == prefix)
        .map(|key| key.suffix)
        .max();

    match highest {
        None => Ok(SUFFIX_MIN),
        Some(highest) if highest >= SUFFIX_MAX => {
            warn!(prefix, "Reached max index number for requested user_key_url");
            Err(BackendError::RegistryFull {
                prefix: prefix.to_string(),
                limit: SUFFIX_MAX,
            })
        }
        Some(highest) => Ok(highest.max(SUFFIX_MIN - 1) + 1),
    }
}

/// Next suffix for `prefix` among the backends in the registry
pub fn allocate_suffix(registry: &Registry, prefix: &str) -> Result<u16, BackendError> {
    let keys: Vec<LocationKey> = registry
        .records()
        .filter_map(|record| record.location_key())
        .collect();
    next_suffix(prefix, &keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::cell::Cell;

    fn keys(prefix: &str, suffixes: &[u16]) -> Vec<LocationKey> {
        suffixes.iter().map(|s| LocationKey::new(prefix, *s)).collect()
    }

    #[test]
    fn test_suffix_empty_registry() {
        assert_eq!(next_suffix("myapp", &Vec::<LocationKey>::new()).unwrap(), 100);
    }

    #[test]
    fn test_suffix_after_highest() {
        let used = keys("myapp", &[100, 101, 105]);
        assert_eq!(next_suffix("myapp", &used).unwrap(), 106);
    }

    #[test]
    fn test_suffix_ignores_other_prefixes() {
        let mut used = keys("other", &[500, 998]);
        used.extend(keys("myapp", &[200]));
        assert_eq!(next_suffix("myapp", &used).unwrap(), 201);
        assert_eq!(next_suffix("third", &used).unwrap(), 100);
    }

    #[test]
    fn test_suffix_exhausted() {
        let used = keys("myapp", &[100, 999]);
        let err = next_suffix("myapp", &used).unwrap_err();
        assert!(matches!(err, BackendError::RegistryFull { limit: 999, .. }));

        let used = keys("myapp", &[1000]);
        assert!(next_suffix("myapp", &used).is_err());
    }

    #[test]
    fn test_suffix_below_range_starts_at_min() {
        let used = keys("myapp", &[7]);
        assert_eq!(next_suffix("myapp", &used).unwrap(), 100);
    }

    #[test]
    fn test_random_id_has_ten_digits() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..1000 {
            let id = random_id(&mut rng);
            assert_eq!(id.to_string().len(), 10);
        }
    }

    #[test]
    fn test_allocate_id_skips_taken() {
        let mut rng = StdRng::seed_from_u64(42);
        let calls = Cell::new(0);
        let id = allocate_id_with(&mut rng, |_| {
            calls.set(calls.get() + 1);
            calls.get() <= 3
        })
        .unwrap();
        assert_eq!(calls.get(), 4);
        assert_eq!(id.to_string().len(), 10);
    }

    #[test]
    fn test_allocate_id_gives_up() {
        let mut rng = StdRng::seed_from_u64(1);
        let err = allocate_id_with(&mut rng, |_| true).unwrap_err();
        assert!(matches!(err, BackendError::Conflict(_)));
    }
}

//! Create, update and delete through BackendService against real directories

use routekeeper::codec::{self, FileEntry};
use routekeeper::error::BackendError;
use routekeeper::record::{BackendRecord, NewBackend};
use routekeeper::registry::{list_all, Registry};
use routekeeper::reload::Reload;
use routekeeper::service::BackendService;
use routekeeper::template::TemplateStore;
use routekeeper::upstream;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

const TEMPLATE: &str = "\
location /{{ key_url }}/ {
    # backend {{ backend_id }} owned by {{ owner }}
    {% if auth_enabled %}access_by_lua_file {{ user_path }}/check.lua;{% endif %}
    proxy_pass {{ upstream_url }};
}
";

#[derive(Default)]
struct CountingReloader {
    count: AtomicUsize,
}

impl CountingReloader {
    fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl Reload for CountingReloader {
    fn reload(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}

struct Fixture {
    backends: TempDir,
    _templates: TempDir,
    reloader: Arc<CountingReloader>,
    service: BackendService,
}

fn fixture() -> Fixture {
    let backends = TempDir::new().unwrap();
    let templates = TempDir::new().unwrap();
    fs::write(
        templates.path().join(TemplateStore::file_name("rstudio", "v04")),
        TEMPLATE,
    )
    .unwrap();
    fs::write(
        templates.path().join(TemplateStore::file_name("legacy", "v1")),
        "location /{{ key_url }}/ {\n    access_by_lua_file {{ forc_backend_path }}/users/{{ backend_id }};\n    proxy_pass {{ location_url }};\n}\n",
    )
    .unwrap();
    fs::write(
        templates.path().join(TemplateStore::file_name("blank", "v1")),
        "{% if false %}never{% endif %}\n",
    )
    .unwrap();

    let reloader = Arc::new(CountingReloader::default());
    let service = BackendService::new(
        Registry::open(backends.path()),
        TemplateStore::new(templates.path()),
        reloader.clone(),
        backends.path().join("users"),
    );

    Fixture {
        backends,
        _templates: templates,
        reloader,
        service,
    }
}

fn request(prefix: &str, upstream: &str) -> NewBackend {
    NewBackend {
        owner: "a".repeat(30),
        user_key_url: prefix.to_string(),
        upstream_url: upstream.to_string(),
        template: "rstudio".to_string(),
        template_version: "v04".to_string(),
        auth_enabled: true,
    }
}

fn on_disk(fx: &Fixture) -> Vec<BackendRecord> {
    list_all(fx.backends.path())
}

#[test]
fn test_create_backend() {
    let fx = fixture();
    let created = fx.service.create(&request("myapp", "http://10.0.0.1:9000")).unwrap();

    assert_eq!(created.location_url, "myapp_100");
    assert_eq!(created.id.to_string().len(), 10);
    assert!(created.auth_enabled);
    assert_eq!(created.owner, "a".repeat(30));
    assert_eq!(created.template, "rstudio");
    assert_eq!(created.template_version, "v04");

    let file_name = created.file_path.file_name().unwrap().to_str().unwrap();
    assert_eq!(file_name, codec::encode(&created));
    assert!(matches!(codec::classify(file_name), FileEntry::Backend(ref r) if *r == created));

    let contents = fs::read_to_string(&created.file_path).unwrap();
    assert!(contents.contains("location /myapp_100/"));
    assert!(contents.contains(&format!("backend {}", created.id)));
    assert!(contents.contains("access_by_lua_file"));
    assert_eq!(upstream::extract(&created.file_path).unwrap(), "http://10.0.0.1:9000");

    assert_eq!(fx.service.get(created.id).unwrap(), created);
    assert_eq!(fx.reloader.count(), 1);
}

#[test]
fn test_create_with_legacy_template_names() {
    let fx = fixture();
    let mut input = request("myapp", "http://10.0.0.1:9000");
    input.template = "legacy".to_string();
    input.template_version = "v1".to_string();

    let created = fx.service.create(&input).unwrap();
    let contents = fs::read_to_string(&created.file_path).unwrap();
    assert!(contents.contains(&format!(
        "access_by_lua_file {}/users/{};",
        fx.backends.path().display(),
        created.id
    )));
    assert_eq!(upstream::extract(&created.file_path).unwrap(), "http://10.0.0.1:9000");
}

#[test]
fn test_create_assigns_increasing_suffixes() {
    let fx = fixture();
    let first = fx.service.create(&request("myapp", "http://10.0.0.1:1")).unwrap();
    let second = fx.service.create(&request("myapp", "http://10.0.0.2:2")).unwrap();
    let other = fx.service.create(&request("other", "http://10.0.0.3:3")).unwrap();

    assert_eq!(first.location_url, "myapp_100");
    assert_eq!(second.location_url, "myapp_101");
    assert_eq!(other.location_url, "other_100");
    assert_ne!(first.id, second.id);
    assert_eq!(fx.service.list().len(), 3);
}

#[test]
fn test_create_replaces_backend_for_same_upstream() {
    let fx = fixture();
    let first = fx.service.create(&request("first", "http://10.0.0.1:9000")).unwrap();
    let second = fx
        .service
        .create(&request("second", "http://10.0.0.1:9000/rstudio/"))
        .unwrap();

    let records = on_disk(&fx);
    assert_eq!(records, vec![second.clone()]);
    assert!(!first.file_path.exists());
    assert!(matches!(fx.service.get(first.id), Err(BackendError::NotFound(_))));
}

#[test]
fn test_create_rejects_invalid_input() {
    let fx = fixture();

    let mut short_owner = request("myapp", "http://10.0.0.1:9000");
    short_owner.owner = "short".to_string();
    let bad_prefix = request("my_app", "http://10.0.0.1:9000");
    let bad_upstream = request("myapp", "10.0.0.1:9000");

    for input in [short_owner, bad_prefix, bad_upstream] {
        assert!(matches!(fx.service.create(&input), Err(BackendError::Validation(_))));
    }
    assert!(on_disk(&fx).is_empty());
    assert_eq!(fx.reloader.count(), 0);
}

#[test]
fn test_create_with_missing_template() {
    let fx = fixture();
    let mut input = request("myapp", "http://10.0.0.1:9000");
    input.template_version = "v99".to_string();

    assert!(matches!(fx.service.create(&input), Err(BackendError::NotFound(_))));
    assert!(on_disk(&fx).is_empty());
}

#[test]
fn test_create_with_blank_render() {
    let fx = fixture();
    let existing = fx.service.create(&request("keep", "http://10.0.0.1:9000")).unwrap();

    let mut input = request("myapp", "http://10.0.0.1:9000");
    input.template = "blank".to_string();
    input.template_version = "v1".to_string();

    assert!(matches!(fx.service.create(&input), Err(BackendError::Template(_))));
    // The failed create must not have cleaned up the existing backend
    assert_eq!(on_disk(&fx), vec![existing]);
}

#[test]
fn test_create_when_prefix_is_full() {
    let fx = fixture();
    let full = BackendRecord {
        id: 1234567890,
        owner: "a".repeat(30),
        location_url: "myapp_999".to_string(),
        template: "rstudio".to_string(),
        template_version: "v04".to_string(),
        auth_enabled: true,
        file_path: PathBuf::new(),
    };
    fs::write(
        fx.backends.path().join(codec::encode(&full)),
        "proxy_pass http://10.9.9.9:1;\n",
    )
    .unwrap();
    assert_eq!(fx.service.rescan(), 1);

    let err = fx
        .service
        .create(&request("myapp", "http://10.0.0.1:9000"))
        .unwrap_err();
    assert!(matches!(err, BackendError::RegistryFull { limit: 999, .. }));

    // Other prefixes are unaffected
    assert!(fx.service.create(&request("other", "http://10.0.0.1:9000")).is_ok());
}

#[test]
fn test_update_auth_preserves_identity() {
    let fx = fixture();
    let created = fx.service.create(&request("myapp", "http://10.0.0.1:9000/app")).unwrap();

    let updated = fx.service.update_auth(created.id, false).unwrap();
    assert_eq!(updated.id, created.id);
    assert_eq!(updated.owner, created.owner);
    assert_eq!(updated.location_url, created.location_url);
    assert_eq!(updated.template, created.template);
    assert_eq!(updated.template_version, created.template_version);
    assert!(!updated.auth_enabled);

    // Only the origin of the upstream survives a re-render
    assert_eq!(upstream::extract(&updated.file_path).unwrap(), "http://10.0.0.1:9000");
    assert!(!fs::read_to_string(&updated.file_path)
        .unwrap()
        .contains("access_by_lua_file"));

    assert!(!created.file_path.exists());
    assert_eq!(on_disk(&fx), vec![updated]);
    assert_eq!(fx.reloader.count(), 2);
}

#[test]
fn test_update_auth_to_same_value() {
    let fx = fixture();
    let created = fx.service.create(&request("myapp", "http://10.0.0.1:9000")).unwrap();

    let updated = fx.service.update_auth(created.id, true).unwrap();
    assert_eq!(updated, created);
    assert_eq!(updated.file_path, created.file_path);
    assert!(updated.file_path.exists());
    assert_eq!(on_disk(&fx).len(), 1);
}

#[test]
fn test_update_auth_removes_other_backends_for_upstream() {
    let fx = fixture();
    let created = fx.service.create(&request("myapp", "http://10.0.0.1:9000")).unwrap();

    // Dropped in by hand, bypassing duplicate resolution
    let stray = BackendRecord {
        id: 1111111111,
        owner: "b".repeat(30),
        location_url: "stray_100".to_string(),
        template: "rstudio".to_string(),
        template_version: "v04".to_string(),
        auth_enabled: true,
        file_path: PathBuf::new(),
    };
    let stray_path = fx.backends.path().join(codec::encode(&stray));
    fs::write(&stray_path, "proxy_pass http://10.0.0.1:9000;\n").unwrap();
    fx.service.rescan();

    let updated = fx.service.update_auth(created.id, false).unwrap();
    assert!(!stray_path.exists());
    assert_eq!(on_disk(&fx), vec![updated]);
}

#[test]
fn test_update_auth_unknown_backend() {
    let fx = fixture();
    assert!(matches!(
        fx.service.update_auth(1234567890, false),
        Err(BackendError::NotFound(_))
    ));
}

#[test]
fn test_update_auth_without_upstream() {
    let fx = fixture();
    let created = fx.service.create(&request("myapp", "http://10.0.0.1:9000")).unwrap();
    fs::write(&created.file_path, "location /myapp_100/ { return 204; }\n").unwrap();

    assert!(matches!(
        fx.service.update_auth(created.id, false),
        Err(BackendError::InvalidState(_))
    ));
    assert!(created.file_path.exists());
}

#[test]
fn test_update_auth_keeps_hand_written_location() {
    let fx = fixture();
    let mut record = BackendRecord {
        id: 1234567890,
        owner: "a".repeat(30),
        location_url: "myapp_0100".to_string(),
        template: "rstudio".to_string(),
        template_version: "v04".to_string(),
        auth_enabled: true,
        file_path: PathBuf::new(),
    };
    let odd_path = fx.backends.path().join(codec::encode(&record));
    fs::write(&odd_path, "proxy_pass http://10.0.0.1:9000;\n").unwrap();

    record.id = 1234567891;
    record.location_url = "myapp_042".to_string();
    let padded_path = fx.backends.path().join(codec::encode(&record));
    fs::write(&padded_path, "proxy_pass http://10.0.0.2:9000;\n").unwrap();
    fx.service.rescan();

    // A suffix that would not survive a round trip is left alone
    assert!(matches!(
        fx.service.update_auth(1234567890, false),
        Err(BackendError::InvalidState(_))
    ));
    assert!(odd_path.exists());

    let updated = fx.service.update_auth(1234567891, false).unwrap();
    assert_eq!(updated.location_url, "myapp_042");
    assert!(updated.file_path.exists());
    assert!(!padded_path.exists());
    assert_eq!(on_disk(&fx).len(), 2);
}

#[test]
fn test_delete_twice() {
    let fx = fixture();
    let created = fx.service.create(&request("myapp", "http://10.0.0.1:9000")).unwrap();

    let deleted = fx.service.delete(created.id).unwrap();
    assert_eq!(deleted, created);
    assert!(!created.file_path.exists());
    assert!(fx.service.list().is_empty());

    assert!(matches!(fx.service.delete(created.id), Err(BackendError::NotFound(_))));
    assert_eq!(fx.reloader.count(), 2);
}

#[test]
fn test_delete_frees_location_for_reuse() {
    let fx = fixture();
    let first = fx.service.create(&request("myapp", "http://10.0.0.1:1")).unwrap();
    fx.service.delete(first.id).unwrap();

    let second = fx.service.create(&request("myapp", "http://10.0.0.2:2")).unwrap();
    assert_eq!(second.location_url, "myapp_100");
}

#[test]
fn test_list_by_owner_and_template() {
    let fx = fixture();
    let mine = fx.service.create(&request("myapp", "http://10.0.0.1:1")).unwrap();
    let mut theirs = request("theirs", "http://10.0.0.2:2");
    theirs.owner = "b".repeat(30);
    fx.service.create(&theirs).unwrap();

    assert_eq!(fx.service.list_by_owner(&"a".repeat(30)), vec![mine]);
    assert!(fx.service.list_by_owner("nobody").is_empty());
    assert_eq!(fx.service.list_by_template("rstudio").len(), 2);
    assert!(fx.service.list_by_template("jupyter").is_empty());
}

#[test]
fn test_concurrent_creates_get_distinct_locations() {
    let fx = fixture();

    let created: Vec<BackendRecord> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let service = &fx.service;
                scope.spawn(move || {
                    service
                        .create(&request("myapp", &format!("http://10.0.1.{}:8080", i)))
                        .unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let mut locations: Vec<&str> = created.iter().map(|r| r.location_url.as_str()).collect();
    locations.sort();
    locations.dedup();
    assert_eq!(locations.len(), 16);

    let mut ids: Vec<u64> = created.iter().map(|r| r.id).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 16);

    assert_eq!(on_disk(&fx).len(), 16);
    assert_eq!(fx.reloader.count(), 16);
}

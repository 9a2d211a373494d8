use super::*;
use crate::domain::SessionState;
use chrono::Utc;
use tempfile::tempdir;

const LONG: Duration = Duration::from_secs(3600);
const SHORT: Duration = Duration::from_millis(50);

fn sample_session(code: &str) -> Session {
    let coord = Identity::parse("coord-1").unwrap();
    Session::new(JoinCode::parse(code).unwrap(), coord, Utc::now())
}

fn backends() -> (Vec<Arc<dyn SessionStore>>, tempfile::TempDir) {
    let dir = tempdir().unwrap();
    let file = FileStore::open(dir.path()).unwrap();
    (vec![Arc::new(MemoryStore::new()), Arc::new(file)], dir)
}

#[tokio::test]
async fn test_set_get_delete_roundtrip() {
    let (stores, _dir) = backends();
    for store in stores {
        let session = sample_session("1234");
        let code = session.code.clone();

        assert!(store.get(&code).await.unwrap().is_none());
        assert!(!store.exists(&code).await.unwrap());

        store.set(&session, LONG).await.unwrap();
        let loaded = store.get(&code).await.unwrap().unwrap();
        assert_eq!(loaded.code, code);
        assert_eq!(loaded.coordinator, session.coordinator);
        assert!(store.exists(&code).await.unwrap());

        store.delete(&code).await.unwrap();
        assert!(store.get(&code).await.unwrap().is_none());
        // Deleting again is fine
        store.delete(&code).await.unwrap();
    }
}

#[tokio::test]
async fn test_loaded_session_is_a_copy() {
    let (stores, _dir) = backends();
    for store in stores {
        let session = sample_session("4321");
        store.set(&session, LONG).await.unwrap();

        let mut loaded = store.get(&session.code).await.unwrap().unwrap();
        loaded.state = SessionState::Closed;

        let reloaded = store.get(&session.code).await.unwrap().unwrap();
        assert_eq!(reloaded.state, SessionState::Open);
    }
}

#[tokio::test]
async fn test_entries_expire_after_ttl() {
    let (stores, _dir) = backends();
    for store in stores {
        let session = sample_session("5555");
        let identity = Identity::parse("member-1").unwrap();
        store.set(&session, SHORT).await.unwrap();
        store
            .bind_identity(&identity, &session.code, SHORT)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;

        assert!(!store.exists(&session.code).await.unwrap());
        assert!(store.get(&session.code).await.unwrap().is_none());
        assert!(store.bound_session(&identity).await.unwrap().is_none());
    }
}

#[tokio::test]
async fn test_unrepresentable_ttl_is_an_error() {
    let (stores, _dir) = backends();
    for store in stores {
        let session = sample_session("6060");
        let err = store.set(&session, Duration::MAX).await.unwrap_err();
        assert!(err.to_string().contains("out of range"));
        assert!(!store.exists(&session.code).await.unwrap());

        let who = Identity::parse("user-1").unwrap();
        assert!(store
            .bind_identity(&who, &session.code, Duration::MAX)
            .await
            .is_err());
        assert!(store.bound_session(&who).await.unwrap().is_none());
    }
}

#[tokio::test]
async fn test_set_refreshes_expiry() {
    let (stores, _dir) = backends();
    for store in stores {
        let session = sample_session("6060");
        store.set(&session, SHORT).await.unwrap();
        store.set(&session, LONG).await.unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;

        assert!(store.exists(&session.code).await.unwrap());
    }
}

#[tokio::test]
async fn test_identity_binding_lifecycle() {
    let (stores, _dir) = backends();
    for store in stores {
        let identity = Identity::parse("member-2").unwrap();
        let code = JoinCode::parse("7777").unwrap();

        assert!(store.bound_session(&identity).await.unwrap().is_none());

        store.bind_identity(&identity, &code, LONG).await.unwrap();
        assert_eq!(store.bound_session(&identity).await.unwrap(), Some(code));

        let moved = JoinCode::parse("8888").unwrap();
        store.bind_identity(&identity, &moved, LONG).await.unwrap();
        assert_eq!(
            store.bound_session(&identity).await.unwrap(),
            Some(moved.clone())
        );

        store.unbind_identity(&identity).await.unwrap();
        assert!(store.bound_session(&identity).await.unwrap().is_none());
    }
}

#[tokio::test]
async fn test_purge_expired_counts_sessions() {
    let (stores, _dir) = backends();
    for store in stores {
        store.set(&sample_session("1111"), SHORT).await.unwrap();
        store.set(&sample_session("2222"), SHORT).await.unwrap();
        store.set(&sample_session("3333"), LONG).await.unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;

        assert_eq!(store.purge_expired().await.unwrap(), 2);
        assert!(store
            .exists(&JoinCode::parse("3333").unwrap())
            .await
            .unwrap());
        assert_eq!(store.purge_expired().await.unwrap(), 0);
    }
}

#[tokio::test]
async fn test_file_store_survives_reopen() {
    let dir = tempdir().unwrap();
    let session = sample_session("2468");
    {
        let store = FileStore::open(dir.path()).unwrap();
        store.set(&session, LONG).await.unwrap();
    }

    let store = FileStore::open(dir.path()).unwrap();
    let loaded = store.get(&session.code).await.unwrap().unwrap();
    assert_eq!(loaded.code, session.code);
    assert_eq!(store.dir(), dir.path());
}

#[test]
fn test_file_store_rejects_second_open() {
    let dir = tempdir().unwrap();
    let _first = FileStore::open(dir.path()).unwrap();

    let err = FileStore::open(dir.path()).err().unwrap();
    assert!(format!("{err:#}").contains("in use by another process"));
}

#[tokio::test]
async fn test_file_store_purge_skips_foreign_files() {
    let dir = tempdir().unwrap();
    let store = FileStore::open(dir.path()).unwrap();
    std::fs::write(dir.path().join("notes.txt"), "hello").unwrap();
    std::fs::write(dir.path().join("9999.json"), "not json").unwrap();

    assert_eq!(store.purge_expired().await.unwrap(), 0);
    assert!(dir.path().join("notes.txt").exists());
}

#[test]
fn test_open_memory_backend() {
    let store = open(&StoreConfig::Memory);
    assert!(store.is_ok());
}

#[test]
fn test_open_file_backend_with_dir() {
    let dir = tempdir().unwrap();
    let config = StoreConfig::File {
        dir: Some(dir.path().join("sessions")),
    };
    open(&config).unwrap();
    assert!(dir.path().join("sessions").join("identities").is_dir());
}

use chrono::{TimeDelta, Utc};
use log::LevelFilter;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use token_store::config::{DatabaseStoreConfig, FileStoreConfig, SigningConfig};
use token_store::{
    create_store, Clock, Fingerprint, GenerateBasic, ManualClock, Store, StoreBackend, StoreConfig,
    TokenConfig, TokenError, TokenRecord, TokenService, TokenStore, TokenStrategy,
};

/// A store under test together with anything that must outlive it.
struct Backend {
    store: Store,
    _dir: Option<TempDir>,
}

fn init_logger() {
    let _ = env_logger::builder()
        .filter_level(LevelFilter::Debug)
        .is_test(true)
        .try_init();
}

/// Every backend that runs without an external server.
async fn backends(clock: &ManualClock) -> Vec<Backend> {
    init_logger();
    let clock: Arc<dyn Clock> = Arc::new(clock.clone());

    let memory = create_store(&StoreConfig::default(), clock.clone())
        .await
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let file = create_store(
        &StoreConfig {
            backend: StoreBackend::File,
            file: FileStoreConfig {
                path: dir.path().join("tokens.redb"),
            },
            ..Default::default()
        },
        clock.clone(),
    )
    .await
    .unwrap();

    let database = create_store(
        &StoreConfig {
            backend: StoreBackend::Database,
            database: DatabaseStoreConfig {
                // one connection: every ":memory:" connection is its own database
                url: "sqlite::memory:".to_string(),
                max_connections: 1,
                sweep_interval_secs: 0,
                ..Default::default()
            },
            ..Default::default()
        },
        clock,
    )
    .await
    .unwrap();

    vec![
        Backend {
            store: memory,
            _dir: None,
        },
        Backend {
            store: file,
            _dir: Some(dir),
        },
        Backend {
            store: database,
            _dir: None,
        },
    ]
}

fn grant(
    access: &str,
    refresh: &str,
    clock: &ManualClock,
    access_secs: u64,
    refresh_secs: u64,
) -> TokenRecord {
    TokenRecord::new("c1", "u1", "app")
        .with_access(access, clock.now(), Duration::from_secs(access_secs))
        .with_refresh(refresh, clock.now(), Duration::from_secs(refresh_secs))
}

fn opaque_config() -> TokenConfig {
    TokenConfig {
        strategy: TokenStrategy::Opaque,
        access_token_expire_secs: 1,
        refresh_token_expire_secs: 10,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_round_trip_on_every_backend() {
    let clock = ManualClock::new(Utc::now());
    for backend in backends(&clock).await {
        let store = &backend.store;
        let created = store
            .create(grant("a-1", "r-1", &clock, 3600, 864000))
            .await
            .unwrap();

        let found = store.get_by_access("a-1").await.unwrap();
        assert_eq!(found.client_id, "c1", "{:?}", store.backend());
        assert_eq!(found.user_id, "u1");
        assert_eq!(found.scope, "app");

        let drift = (found.access_expires_at().unwrap() - created.access_expires_at().unwrap())
            .num_milliseconds()
            .abs();
        assert!(drift <= 1000, "access expiry drifted by {drift}ms");
        assert_eq!(store.get_by_refresh("r-1").await.unwrap(), found);
    }
}

#[tokio::test]
async fn test_fingerprint_idempotency_on_every_backend() {
    let clock = ManualClock::new(Utc::now());
    for backend in backends(&clock).await {
        let service =
            TokenService::with_store(opaque_config(), backend.store.clone(), Arc::new(clock.clone()))
                .unwrap();
        let basic = GenerateBasic::new("c1", "u1", "app", clock.now());

        let first = service.issue(&basic, true).await.unwrap();
        let second = service.issue(&basic, true).await.unwrap();
        assert_eq!(second.access, first.access, "{:?}", backend.store.backend());
        assert_eq!(second.refresh, first.refresh);

        clock.advance(Duration::from_secs(2));
        let basic = GenerateBasic::new("c1", "u1", "app", clock.now());
        let third = service.issue(&basic, true).await.unwrap();
        assert_ne!(third.access, first.access);
        assert_eq!(third.refresh, first.refresh);
        assert_eq!(third.refresh_created_at, first.refresh_created_at);
    }
}

#[tokio::test]
async fn test_rotation_boundary_on_every_backend() {
    let start = Utc::now();
    let clock = ManualClock::new(start);
    for backend in backends(&clock).await {
        clock.set(start);
        let store = &backend.store;
        let first = store
            .create(grant("a-1", "r-1", &clock, 1, 10))
            .await
            .unwrap();

        // t=2s: access expired, refresh alive
        clock.set(start + TimeDelta::seconds(2));
        let rotated = store
            .create(grant("a-2", "r-1", &clock, 1, 10))
            .await
            .unwrap();
        assert_eq!(rotated.access, "a-2", "{:?}", store.backend());
        assert_eq!(rotated.access_created_at, clock.now());
        assert_eq!(rotated.refresh_created_at, first.refresh_created_at);
        assert_eq!(store.get_by_access("a-2").await.unwrap(), rotated);
        assert_eq!(store.get_by_refresh("r-1").await.unwrap().access, "a-2");

        // t=11s: both expired, the grant starts over
        clock.set(start + TimeDelta::seconds(11));
        let fresh = store
            .create(grant("a-3", "r-1", &clock, 1, 10))
            .await
            .unwrap();
        assert_eq!(fresh.refresh_created_at, clock.now());
        assert_eq!(fresh.access_created_at, clock.now());
        let by_fingerprint = store
            .get_by_fingerprint(&Fingerprint::of("u1", "c1", "app"))
            .await
            .unwrap();
        assert_eq!(by_fingerprint, fresh);
    }
}

#[tokio::test]
async fn test_cascade_delete_on_every_backend() {
    let clock = ManualClock::new(Utc::now());
    for backend in backends(&clock).await {
        let store = &backend.store;
        store
            .create(grant("a-1", "r-1", &clock, 60, 600))
            .await
            .unwrap();

        store.remove_by_refresh("r-1").await.unwrap();

        assert!(
            matches!(store.get_by_access("a-1").await, Err(TokenError::NotFound)),
            "{:?}",
            store.backend()
        );
        assert!(matches!(
            store.get_by_refresh("r-1").await,
            Err(TokenError::NotFound)
        ));
        assert!(matches!(
            store
                .get_by_fingerprint(&Fingerprint::of("u1", "c1", "app"))
                .await,
            Err(TokenError::NotFound)
        ));
    }
}

#[tokio::test]
async fn test_remove_by_code_cascades_on_every_backend() {
    let clock = ManualClock::new(Utc::now());
    for backend in backends(&clock).await {
        let store = &backend.store;
        store
            .create(grant("a-1", "r-1", &clock, 60, 600))
            .await
            .unwrap();
        // a code record remembering the pair it was exchanged for
        let code = grant("a-1", "r-1", &clock, 60, 600).with_code(
            "code-1",
            clock.now(),
            Duration::from_secs(30),
        );
        store.create(code).await.unwrap();
        assert_eq!(
            store.get_by_code("code-1").await.unwrap().access,
            "a-1",
            "{:?}",
            store.backend()
        );

        store.remove_by_code("code-1").await.unwrap();
        assert!(matches!(
            store.get_by_code("code-1").await,
            Err(TokenError::NotFound)
        ));
        assert!(matches!(
            store.get_by_access("a-1").await,
            Err(TokenError::NotFound)
        ));
        assert!(matches!(
            store.get_by_refresh("r-1").await,
            Err(TokenError::NotFound)
        ));
    }
}

#[tokio::test]
async fn test_concrete_scenario_on_every_backend() {
    let clock = ManualClock::new(Utc::now());
    for backend in backends(&clock).await {
        let store = &backend.store;
        let created = store
            .create(grant("a-1", "r-1", &clock, 3600, 864000))
            .await
            .unwrap();

        let fingerprint = Fingerprint::of("u1", "c1", "app");
        assert_eq!(fingerprint.as_str(), token_store::token_key("u1c1app"));
        assert_eq!(store.get_by_fingerprint(&fingerprint).await.unwrap(), created);

        assert!(
            matches!(
                store.remove_by_code("unrelated-code").await,
                Err(TokenError::NotFound)
            ),
            "{:?}",
            store.backend()
        );
        assert_eq!(store.get_by_access("a-1").await.unwrap(), created);
    }
}

#[tokio::test]
async fn test_resolver_generator_pairing() {
    init_logger();
    let clock = ManualClock::new(Utc::now());
    let signed = TokenService::with_clock(
        TokenConfig {
            strategy: TokenStrategy::Signed,
            signing: SigningConfig {
                secret: "s3cret".to_string(),
                ..Default::default()
            },
            ..Default::default()
        },
        Arc::new(clock.clone()),
    )
    .await
    .unwrap();
    let opaque = TokenService::with_clock(TokenConfig::default(), Arc::new(clock.clone()))
        .await
        .unwrap();
    let basic = GenerateBasic::new("c1", "u1", "app", clock.now());

    let jwt = signed.issue(&basic, true).await.unwrap();
    assert!(signed.resolve(&jwt.access).await.is_ok());
    assert!(matches!(
        opaque.resolve(&jwt.access).await,
        Err(TokenError::InvalidToken(_))
    ));

    let random = opaque.issue(&basic, true).await.unwrap();
    assert!(opaque.resolve(&random.access).await.is_ok());
    assert!(matches!(
        signed.resolve(&random.access).await,
        Err(TokenError::InvalidToken(_))
    ));
}

#[tokio::test]
async fn test_unauthorized_outcomes_are_one_family() {
    init_logger();
    let clock = ManualClock::new(Utc::now());
    let config = TokenConfig {
        access_token_expire_secs: 60,
        refresh_token_expire_secs: 600,
        ..opaque_config()
    };
    let service = TokenService::with_clock(config, Arc::new(clock.clone()))
        .await
        .unwrap();
    let issued = service
        .issue(&GenerateBasic::new("c1", "u1", "app", clock.now()), false)
        .await
        .unwrap();

    clock.advance(Duration::from_secs(60));
    let expired = service.resolve(&issued.access).await.unwrap_err();
    let missing = service
        .resolve(&token_store::generator::opaque::random_token())
        .await
        .unwrap_err();
    let malformed = service.resolve("garbage").await.unwrap_err();

    assert!(matches!(expired, TokenError::Expired));
    assert!(matches!(missing, TokenError::NotFound));
    assert!(matches!(malformed, TokenError::InvalidToken(_)));
    assert!([expired, missing, malformed]
        .iter()
        .all(TokenError::is_unauthorized));
}

use super::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Mutex;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config(id: &str) -> TenantConfig {
    TenantConfig::new(id, "xoxb-token", "signing-secret")
}

/// In-memory fake with a failure switch, for exercising the chain without
/// real backends.
struct FakeTier {
    name: &'static str,
    map: Mutex<HashMap<String, TenantConfig>>,
    failing: AtomicBool,
    saves: AtomicUsize,
}

impl FakeTier {
    fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            map: Mutex::new(HashMap::new()),
            failing: AtomicBool::new(false),
            saves: AtomicUsize::new(0),
        })
    }

    fn fail(&self, on: bool) {
        self.failing.store(on, Ordering::SeqCst);
    }

    fn err(&self) -> SwitchboardError {
        SwitchboardError::Store {
            tier: self.name,
            message: "forced failure".into(),
        }
    }
}

#[async_trait]
impl TenantStore for FakeTier {
    fn tier(&self) -> &'static str {
        self.name
    }

    async fn save(&self, config: &TenantConfig) -> SwitchboardResult<()> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(self.err());
        }
        self.map
            .lock()
            .await
            .insert(config.tenant_id.clone(), config.clone());
        Ok(())
    }

    async fn load(&self, tenant_id: &str) -> SwitchboardResult<Option<TenantConfig>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(self.err());
        }
        Ok(self.map.lock().await.get(tenant_id).cloned())
    }

    async fn load_by_team(&self, team_id: &str) -> SwitchboardResult<Option<TenantConfig>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(self.err());
        }
        Ok(self
            .map
            .lock()
            .await
            .values()
            .find(|c| c.team_id.as_deref() == Some(team_id))
            .cloned())
    }

    async fn delete(&self, tenant_id: &str) -> SwitchboardResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(self.err());
        }
        self.map.lock().await.remove(tenant_id);
        Ok(())
    }

    async fn count(&self) -> SwitchboardResult<u64> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(self.err());
        }
        Ok(self.map.lock().await.len() as u64)
    }
}

#[tokio::test]
async fn write_prefers_first_tier() {
    let primary = FakeTier::new("database");
    let secondary = FakeTier::new("kv");
    let store = TieredTenantStore::new(vec![primary.clone() as Arc<dyn TenantStore>, secondary.clone()]);

    store.save(&config("T1")).await.unwrap();

    assert!(primary.map.lock().await.contains_key("T1"));
    assert!(!secondary.map.lock().await.contains_key("T1"));
}

#[tokio::test]
async fn failed_primary_falls_through_and_read_finds_it() {
    let primary = FakeTier::new("database");
    let secondary = FakeTier::new("kv");
    let store = TieredTenantStore::new(vec![primary.clone() as Arc<dyn TenantStore>, secondary.clone()]);

    primary.fail(true);
    store.save(&config("T1")).await.unwrap();
    assert!(secondary.map.lock().await.contains_key("T1"));

    // Primary is still down; the read falls through too.
    let loaded = store.load("T1").await.unwrap().unwrap();
    assert_eq!(loaded.tenant_id, "T1");
}

#[tokio::test]
async fn read_does_not_backfill_lower_tiers() {
    let primary = FakeTier::new("database");
    let secondary = FakeTier::new("kv");
    let store = TieredTenantStore::new(vec![primary.clone() as Arc<dyn TenantStore>, secondary.clone()]);

    store.save(&config("T1")).await.unwrap();
    let _ = store.load("T1").await.unwrap();

    assert!(secondary.map.lock().await.is_empty());
    assert_eq!(secondary.saves.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn exhausting_every_tier_is_a_hard_failure() {
    let only = FakeTier::new("database");
    only.fail(true);
    let store = TieredTenantStore::new(vec![only.clone() as Arc<dyn TenantStore>]);

    let err = store.save(&config("T1")).await.unwrap_err();
    assert!(matches!(err, SwitchboardError::Store { tier: "all", .. }));
}

#[tokio::test]
async fn upsert_is_idempotent_and_last_write_wins() {
    let tier = FakeTier::new("database");
    let store = TieredTenantStore::new(vec![tier.clone() as Arc<dyn TenantStore>]);

    let mut first = config("T1");
    first.model_id = Some("model-a".into());
    store.upsert(first, None).await.unwrap();

    let mut second = config("T1");
    second.model_id = Some("model-b".into());
    store.upsert(second, None).await.unwrap();

    let map = tier.map.lock().await;
    assert_eq!(map.len(), 1);
    assert_eq!(map["T1"].model_id.as_deref(), Some("model-b"));
    drop(map);
    assert_eq!(store.tenant_count(), 1);
}

#[tokio::test]
async fn upsert_preserves_resolved_fields() {
    let tier = FakeTier::new("database");
    let store = TieredTenantStore::new(vec![tier.clone() as Arc<dyn TenantStore>]);

    let mut resolved = config("T1");
    resolved.team_id = Some("W123".into());
    resolved.bot_user_id = Some("B999".into());
    resolved.api_token = Some("persistent".into());
    store.upsert(resolved, None).await.unwrap();

    // A fresh push carries neither resolved ids nor the API token.
    store.upsert(config("T1"), None).await.unwrap();

    let map = tier.map.lock().await;
    assert_eq!(map["T1"].team_id.as_deref(), Some("W123"));
    assert_eq!(map["T1"].bot_user_id.as_deref(), Some("B999"));
    assert_eq!(map["T1"].api_token.as_deref(), Some("persistent"));
}

#[tokio::test]
async fn upsert_rejects_missing_credentials() {
    let store = TieredTenantStore::new(vec![FakeTier::new("database") as Arc<dyn TenantStore>]);
    let mut bad = config("T1");
    bad.signing_secret = String::new();
    let err = store.upsert(bad, None).await.unwrap_err();
    assert!(matches!(err, SwitchboardError::Config(_)));
}

#[tokio::test]
async fn count_seeds_from_first_shared_tier() {
    let primary = FakeTier::new("database");
    primary.save(&config("A")).await.unwrap();
    primary.save(&config("B")).await.unwrap();
    let store = TieredTenantStore::new(vec![primary as Arc<dyn TenantStore>]);
    store.init_count().await;
    assert_eq!(store.tenant_count(), 2);
}

#[tokio::test]
async fn count_falls_back_to_zero_when_shared_tiers_unreachable() {
    let primary = FakeTier::new("database");
    primary.fail(true);
    let store = TieredTenantStore::new(vec![primary as Arc<dyn TenantStore>]);
    store.init_count().await;
    assert_eq!(store.tenant_count(), 0);
}

#[tokio::test]
async fn delete_decrements_counter() {
    let tier = FakeTier::new("database");
    let store = TieredTenantStore::new(vec![tier.clone() as Arc<dyn TenantStore>]);
    store.upsert(config("T1"), None).await.unwrap();
    assert_eq!(store.tenant_count(), 1);
    store.delete("T1").await.unwrap();
    assert_eq!(store.tenant_count(), 0);
}

#[tokio::test]
async fn bootstrap_token_is_exchanged_once_and_never_persisted() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/tokens"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "token": "long-lived-token"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let exchanger = TokenExchanger::new(format!("{}/tokens", server.uri()));
    let tier = FakeTier::new("database");
    let store = TieredTenantStore::new(vec![tier.clone() as Arc<dyn TenantStore>]);

    let mut pushed = config("T1");
    pushed.bootstrap_token = Some("short-lived".into());
    store.upsert(pushed, Some(&exchanger)).await.unwrap();

    // Second push with another bootstrap token: the persisted API token
    // short-circuits the exchange (expect(1) above enforces it).
    let mut again = config("T1");
    again.bootstrap_token = Some("short-lived-2".into());
    store.upsert(again, Some(&exchanger)).await.unwrap();

    let map = tier.map.lock().await;
    assert_eq!(map["T1"].api_token.as_deref(), Some("long-lived-token"));
    assert!(map["T1"].bootstrap_token.is_none());
}

#[tokio::test]
async fn file_store_round_trips_and_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tenants.json");

    {
        let store = FileStore::open(&path).unwrap();
        let mut cfg = config("T1");
        cfg.team_id = Some("W1".into());
        store.save(&cfg).await.unwrap();
        store.flush().await.unwrap();
    }

    let reopened = FileStore::open(&path).unwrap();
    let loaded = reopened.load("T1").await.unwrap().unwrap();
    assert_eq!(loaded.tenant_id, "T1");
    assert_eq!(reopened.count().await.unwrap(), 1);
    let by_team = reopened.load_by_team("W1").await.unwrap().unwrap();
    assert_eq!(by_team.tenant_id, "T1");
}

#[tokio::test]
async fn file_store_debounce_flushes_without_explicit_flush() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tenants.json");

    let store = FileStore::open(&path).unwrap();
    store.save(&config("T1")).await.unwrap();
    store.save(&config("T2")).await.unwrap();

    // One debounce interval of quiescence plus slack for the writer task.
    tokio::time::sleep(std::time::Duration::from_millis(1500)).await;
    assert!(path.exists());

    let raw = std::fs::read_to_string(&path).unwrap();
    let map: HashMap<String, TenantConfig> = serde_json::from_str(&raw).unwrap();
    assert_eq!(map.len(), 2);
}

#[tokio::test]
async fn rest_store_load_parses_rows() {
    let server = MockServer::start().await;
    let row = config("T1");
    Mock::given(method("GET"))
        .and(path("/rest/v1/tenant_configs"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([row])))
        .mount(&server)
        .await;

    let store = RestStore::new(server.uri(), "service-key");
    let loaded = store.load("T1").await.unwrap().unwrap();
    assert_eq!(loaded.tenant_id, "T1");
}

#[tokio::test]
async fn rest_store_count_reads_content_range() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/tenant_configs"))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header("content-range", "0-0/37")
                .set_body_json(serde_json::json!([])),
        )
        .mount(&server)
        .await;

    let store = RestStore::new(server.uri(), "service-key");
    assert_eq!(store.count().await.unwrap(), 37);
}

#[tokio::test]
async fn rest_store_server_error_surfaces_as_store_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/tenant_configs"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let store = RestStore::new(server.uri(), "service-key");
    let err = store.save(&config("T1")).await.unwrap_err();
    assert!(matches!(err, SwitchboardError::Store { tier: "database", .. }));
}

#[tokio::test]
async fn kv_store_round_trips_through_commands() {
    let server = MockServer::start().await;
    let stored = serde_json::to_string(&config("T1")).unwrap();
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "result": stored
        })))
        .mount(&server)
        .await;

    let store = KvStore::new(server.uri(), "kv-token");
    let loaded = store.load("T1").await.unwrap().unwrap();
    assert_eq!(loaded.tenant_id, "T1");
}

#[tokio::test]
async fn kv_store_null_result_is_a_miss() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "result": null
        })))
        .mount(&server)
        .await;

    let store = KvStore::new(server.uri(), "kv-token");
    assert!(store.load("missing").await.unwrap().is_none());
}

#[test]
fn debug_output_redacts_credentials() {
    let mut cfg = config("T1");
    cfg.api_token = Some("secret-token".into());
    let debug = format!("{:?}", cfg);
    assert!(!debug.contains("xoxb-token"));
    assert!(!debug.contains("signing-secret"));
    assert!(!debug.contains("secret-token"));
    assert!(debug.contains("[REDACTED]"));
}

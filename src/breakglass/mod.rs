// Break-glass emergency database access.
//
// A session hands out a short-lived, least-privilege database role under
// a challenge-response ceremony. Every action is audited, the session can
// be recorded, and after it ends the report stays pending until a human
// acknowledges it. State is in-memory only; sessions do not survive a
// restart.
//
// Per-node state machine:
// Inactive -> Active -> {Expired, PendingAck} -> (Acknowledged) -> Inactive
// with at most one non-inactive session at a time.

mod recording;

pub use recording::{read_recording, EventKind, RecordLine, SessionRecorder};

use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::{Rng, RngCore};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::config::BreakGlassConfig;
use crate::error::{BibError, Result};

const CHALLENGE_TTL: Duration = Duration::from_secs(300);

static DB_USERNAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^breakglass_[A-Za-z0-9]{1,32}$").expect("static regex"));

/// Privilege tier of a session's database role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    ReadOnly,
    ReadWrite,
}

impl std::str::FromStr for AccessLevel {
    type Err = BibError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "readonly" => Ok(AccessLevel::ReadOnly),
            "readwrite" => Ok(AccessLevel::ReadWrite),
            other => Err(BibError::InvalidInput(format!(
                "unknown access level {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    PendingAck,
    Expired,
}

/// An open or recently ended session.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub user: String,
    pub reason: String,
    pub access_level: AccessLevel,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub node_id: String,
    pub db_user: String,
    pub state: SessionState,
}

/// What `enable` hands back: the session plus the credential the caller
/// uses to connect.
#[derive(Debug, Clone)]
pub struct SessionCredentials {
    pub session: Session,
    pub db_user: String,
    pub db_password: String,
}

/// A pending authentication challenge.
#[derive(Debug, Clone)]
pub struct Challenge {
    pub id: String,
    pub nonce: Vec<u8>,
    pub user: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Usage summary computed when a session ends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub query_count: u64,
    pub tables_accessed: Vec<String>,
    pub operation_counts: BTreeMap<String, u64>,
}

/// The report kept pending until acknowledged.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub session: Session,
    pub ended_at: DateTime<Utc>,
    pub duration: Duration,
    pub stats: SessionStats,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<String>,
}

/// Database-side lifecycle of the temporary role.
#[async_trait::async_trait]
pub trait DbProvisioner: Send + Sync {
    /// Create the role and apply the grants for `level`. The `audit_log`
    /// table must never be granted; see `grant_statements`.
    async fn create_role(&self, username: &str, password: &str, level: AccessLevel) -> Result<()>;

    /// Terminate the role's connections and drop it.
    async fn drop_role(&self, username: &str) -> Result<()>;

    /// Usage statistics for the role, gathered from the audit trail.
    async fn session_stats(&self, username: &str) -> Result<SessionStats>;
}

/// One audit event emitted by the manager.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub kind: String,
    pub user: String,
    pub session_id: Option<String>,
    pub details: BTreeMap<String, String>,
    pub at: DateTime<Utc>,
}

impl AuditEvent {
    fn new(kind: &str, user: &str) -> Self {
        Self {
            kind: kind.to_string(),
            user: user.to_string(),
            session_id: None,
            details: BTreeMap::new(),
            at: Utc::now(),
        }
    }

    fn with_session(mut self, session_id: &str) -> Self {
        self.session_id = Some(session_id.to_string());
        self
    }

    fn with_detail(mut self, key: &str, value: impl Into<String>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}

/// Where audit events go. The default sink writes structured log lines.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Audit sink backed by the tracing subscriber.
#[derive(Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        tracing::warn!(
            kind = %event.kind,
            user = %event.user,
            session_id = event.session_id.as_deref().unwrap_or(""),
            details = ?event.details,
            "Break-glass audit event"
        );
    }
}

/// In-memory sink for tests.
#[derive(Default)]
pub struct MemoryAuditSink {
    pub events: Mutex<Vec<AuditEvent>>,
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        self.events.lock().push(event);
    }
}

/// Outbound notification about session lifecycle.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub kind: String,
    pub node_id: String,
    pub session_id: String,
    pub user: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<()>;
}

/// POSTs notifications as JSON to a configured webhook.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait::async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        self.client
            .post(&self.url)
            .json(notification)
            .send()
            .await
            .map_err(BibError::transport)?
            .error_for_status()
            .map_err(BibError::transport)?;
        Ok(())
    }
}

/// Reject any would-be role name that does not match the break-glass
/// pattern. All SQL identity generation goes through this check.
pub fn validate_username(username: &str) -> Result<()> {
    if DB_USERNAME.is_match(username) {
        Ok(())
    } else {
        Err(BibError::InvalidInput(format!(
            "invalid break-glass username {username:?}"
        )))
    }
}

/// The grant set a SQL provisioner executes for a new role, given the
/// public tables it enumerated. `audit_log` is excluded from every grant
/// and revoked explicitly on top.
pub fn grant_statements(username: &str, level: AccessLevel, tables: &[&str]) -> Result<Vec<String>> {
    validate_username(username)?;

    let privileges = match level {
        AccessLevel::ReadOnly => "SELECT",
        AccessLevel::ReadWrite => "SELECT, INSERT, UPDATE, DELETE",
    };

    let mut statements = vec![format!("GRANT USAGE ON SCHEMA public TO {username}")];
    for table in tables {
        if *table == "audit_log" {
            continue;
        }
        statements.push(format!("GRANT {privileges} ON public.{table} TO {username}"));
    }
    statements.push(format!(
        "REVOKE ALL ON public.audit_log FROM {username}"
    ));
    Ok(statements)
}

struct ManagerState {
    session: Option<Session>,
    challenges: HashMap<String, Challenge>,
    pending: Vec<SessionReport>,
    recorder: Option<SessionRecorder>,
    expiry_task: Option<JoinHandle<()>>,
}

/// The in-memory break-glass session manager.
pub struct BreakGlassManager {
    config: BreakGlassConfig,
    node_id: String,
    users: HashMap<String, VerifyingKey>,
    provisioner: Arc<dyn DbProvisioner>,
    audit: Arc<dyn AuditSink>,
    notifier: Option<Arc<dyn Notifier>>,
    state: Mutex<ManagerState>,
}

impl BreakGlassManager {
    pub fn new(
        config: BreakGlassConfig,
        node_id: impl Into<String>,
        provisioner: Arc<dyn DbProvisioner>,
        audit: Arc<dyn AuditSink>,
        notifier: Option<Arc<dyn Notifier>>,
    ) -> Result<Self> {
        let mut users = HashMap::new();
        for allowed in &config.allowed_users {
            let bytes: [u8; 32] = hex::decode(&allowed.public_key)
                .ok()
                .and_then(|v| v.try_into().ok())
                .ok_or_else(|| {
                    BibError::InvalidInput(format!(
                        "public key for user {:?} is not 32 hex-encoded bytes",
                        allowed.name
                    ))
                })?;
            let key = VerifyingKey::from_bytes(&bytes).map_err(|e| {
                BibError::InvalidInput(format!("public key for user {:?}: {e}", allowed.name))
            })?;
            users.insert(allowed.name.clone(), key);
        }

        Ok(Self {
            config,
            node_id: node_id.into(),
            users,
            provisioner,
            audit,
            notifier,
            state: Mutex::new(ManagerState {
                session: None,
                challenges: HashMap::new(),
                pending: Vec::new(),
                recorder: None,
                expiry_task: None,
            }),
        })
    }

    /// Issue an authentication challenge for a known user.
    pub fn create_challenge(&self, user: &str) -> Result<Challenge> {
        if !self.users.contains_key(user) {
            self.audit
                .record(AuditEvent::new("challenge_rejected", user).with_detail("reason", "unknown user"));
            return Err(BibError::Unauthorized);
        }

        let mut nonce = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut nonce);
        let challenge = Challenge {
            id: uuid::Uuid::new_v4().to_string(),
            nonce,
            user: user.to_string(),
            issued_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::from_std(CHALLENGE_TTL).expect("small ttl"),
        };

        let mut state = self.state.lock();
        let now = Utc::now();
        state.challenges.retain(|_, c| c.expires_at > now);
        state.challenges.insert(challenge.id.clone(), challenge.clone());
        drop(state);

        self.audit
            .record(AuditEvent::new("challenge_created", user).with_detail("challenge_id", &challenge.id));
        Ok(challenge)
    }

    /// Verify a challenge signature. The challenge is single-use: it is
    /// deleted on any verification attempt and on expiry.
    pub fn verify_challenge(&self, challenge_id: &str, signature: &[u8]) -> Result<()> {
        let challenge = {
            let mut state = self.state.lock();
            state
                .challenges
                .remove(challenge_id)
                .ok_or_else(|| BibError::not_found(format!("challenge {challenge_id}")))?
        };

        if challenge.expires_at <= Utc::now() {
            self.audit.record(
                AuditEvent::new("challenge_failed", &challenge.user)
                    .with_detail("reason", "expired"),
            );
            return Err(BibError::ChallengeExpired);
        }

        let key = self
            .users
            .get(&challenge.user)
            .ok_or(BibError::Unauthorized)?;
        let signature = Signature::from_slice(signature)
            .map_err(|_| BibError::InvalidInput("malformed signature".to_string()))?;
        if key.verify(&challenge.nonce, &signature).is_err() {
            self.audit.record(
                AuditEvent::new("challenge_failed", &challenge.user)
                    .with_detail("reason", "bad signature"),
            );
            return Err(BibError::Unauthorized);
        }

        self.audit
            .record(AuditEvent::new("challenge_verified", &challenge.user));
        Ok(())
    }

    /// Open a session and provision its database role.
    pub async fn enable(
        self: &Arc<Self>,
        user: &str,
        reason: &str,
        duration: Duration,
        requested_by: &str,
        access_level: Option<AccessLevel>,
    ) -> Result<SessionCredentials> {
        if !self.config.enabled {
            return Err(BibError::InvalidInput(
                "break-glass access is disabled".to_string(),
            ));
        }
        if !self.users.contains_key(user) {
            return Err(BibError::Unauthorized);
        }

        let access_level = match access_level {
            Some(level) => level,
            None => self.config.default_access_level.parse()?,
        };

        let max = self.config.max_duration();
        let duration = if duration.is_zero() || duration > max {
            max
        } else {
            duration
        };

        let session_id = uuid::Uuid::new_v4().to_string();
        let db_user = format!("breakglass_{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
        validate_username(&db_user)?;
        let db_password: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(32)
            .map(char::from)
            .collect();

        let session = Session {
            id: session_id.clone(),
            user: user.to_string(),
            reason: reason.to_string(),
            access_level,
            started_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::from_std(duration).expect("clamped"),
            node_id: self.node_id.clone(),
            db_user: db_user.clone(),
            state: SessionState::Active,
        };

        {
            let mut state = self.state.lock();
            if state.session.is_some() {
                return Err(BibError::SessionActive);
            }
            state.session = Some(session.clone());

            if self.config.session_recording {
                match SessionRecorder::create(&self.config.recording_path, &session_id, user) {
                    Ok(recorder) => state.recorder = Some(recorder),
                    Err(e) => {
                        tracing::warn!(error = %e, "Could not open session recording");
                    }
                }
            }
        }

        if let Err(e) = self
            .provisioner
            .create_role(&db_user, &db_password, access_level)
            .await
        {
            // Roll the reservation back so the node is not wedged.
            let mut state = self.state.lock();
            state.session = None;
            state.recorder = None;
            return Err(e);
        }

        // Expiry timer auto-disables the session.
        let manager = Arc::clone(self);
        let expiring_id = session_id.clone();
        let expiry_task = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            if let Err(e) = manager.expire(&expiring_id).await {
                if !matches!(e, BibError::SessionNotActive | BibError::NotFound(_)) {
                    tracing::warn!(error = %e, "Session expiry failed");
                }
            }
        });
        self.state.lock().expiry_task = Some(expiry_task);

        self.audit.record(
            AuditEvent::new("session_enabled", user)
                .with_session(&session_id)
                .with_detail("reason", reason)
                .with_detail("requested_by", requested_by)
                .with_detail("access_level", format!("{access_level:?}"))
                .with_detail("db_user", &db_user),
        );
        self.notify("session_enabled", &session, "emergency access enabled")
            .await;

        Ok(SessionCredentials {
            session,
            db_user,
            db_password,
        })
    }

    /// Record activity into the open session's recording, if any. Under
    /// the paranoid audit level every event also lands in the audit trail.
    pub fn record_event(&self, kind: EventKind, data: impl Into<String>) {
        let data = data.into();
        let mut state = self.state.lock();
        if let Some(recorder) = state.recorder.as_mut() {
            if let Err(e) = recorder.record(kind, data.clone()) {
                tracing::warn!(error = %e, "Session recording write failed");
            }
        }
        if self.config.audit_level == "paranoid" {
            if let Some(session) = &state.session {
                self.audit.record(
                    AuditEvent::new("session_activity", &session.user)
                        .with_session(&session.id)
                        .with_detail("kind", format!("{kind:?}"))
                        .with_detail("data", data),
                );
            }
        }
    }

    /// Close the active session by operator request.
    pub async fn disable(self: &Arc<Self>, by: &str) -> Result<SessionReport> {
        self.close_session(SessionState::PendingAck, "session_disabled", by).await
    }

    async fn expire(self: &Arc<Self>, session_id: &str) -> Result<SessionReport> {
        {
            let state = self.state.lock();
            match &state.session {
                Some(session) if session.id == session_id => {}
                _ => return Err(BibError::SessionNotActive),
            }
        }
        self.close_session(SessionState::Expired, "session_expired", "expiry-timer")
            .await
    }

    async fn close_session(
        self: &Arc<Self>,
        end_state: SessionState,
        audit_kind: &str,
        by: &str,
    ) -> Result<SessionReport> {
        let (mut session, recorder, expiry_task) = {
            let mut state = self.state.lock();
            let session = match &state.session {
                Some(session) if session.state == SessionState::Active => session.clone(),
                _ => return Err(BibError::SessionNotActive),
            };
            (session, state.recorder.take(), state.expiry_task.take())
        };
        if let Some(task) = expiry_task {
            task.abort();
        }

        // Kill the role first so the credential is dead before anything else.
        self.provisioner.drop_role(&session.db_user).await?;

        let stats = self
            .provisioner
            .session_stats(&session.db_user)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Session stats unavailable");
                SessionStats::default()
            });

        if let Some(recorder) = recorder {
            if let Err(e) = recorder.finish() {
                tracing::warn!(error = %e, "Could not finalize session recording");
            }
        }

        let ended_at = Utc::now();
        let duration = (ended_at - session.started_at)
            .to_std()
            .unwrap_or_default();
        session.state = end_state;

        let report = SessionReport {
            session: session.clone(),
            ended_at,
            duration,
            stats,
            acknowledged_at: None,
            acknowledged_by: None,
        };

        {
            let mut state = self.state.lock();
            if self.config.require_acknowledgment {
                state.pending.push(report.clone());
                if let Some(current) = state.session.as_mut() {
                    current.state = end_state;
                }
            } else {
                state.session = None;
            }
        }

        self.audit.record(
            AuditEvent::new(audit_kind, &session.user)
                .with_session(&session.id)
                .with_detail("by", by)
                .with_detail("query_count", report.stats.query_count.to_string()),
        );
        self.notify(audit_kind, &session, "emergency access ended")
            .await;
        Ok(report)
    }

    /// Acknowledge a pending report, returning the session to inactive.
    pub async fn acknowledge(&self, session_id: &str, by: &str) -> Result<SessionReport> {
        let mut report = {
            let mut state = self.state.lock();
            let idx = state
                .pending
                .iter()
                .position(|r| r.session.id == session_id)
                .ok_or_else(|| BibError::not_found(format!("pending report {session_id}")))?;
            let report = state.pending.remove(idx);
            if state
                .session
                .as_ref()
                .map(|s| s.id == session_id)
                .unwrap_or(false)
            {
                state.session = None;
            }
            report
        };

        report.acknowledged_at = Some(Utc::now());
        report.acknowledged_by = Some(by.to_string());

        self.audit.record(
            AuditEvent::new("session_acknowledged", &report.session.user)
                .with_session(session_id)
                .with_detail("by", by),
        );
        self.notify("session_acknowledged", &report.session, "report acknowledged")
            .await;
        Ok(report)
    }

    pub fn current_session(&self) -> Option<Session> {
        self.state.lock().session.clone()
    }

    pub fn pending_reports(&self) -> Vec<SessionReport> {
        self.state.lock().pending.clone()
    }

    async fn notify(&self, kind: &str, session: &Session, message: &str) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        let notification = Notification {
            kind: kind.to_string(),
            node_id: self.node_id.clone(),
            session_id: session.id.clone(),
            user: session.user.clone(),
            message: message.to_string(),
            at: Utc::now(),
        };
        if let Err(e) = notifier.notify(&notification).await {
            tracing::warn!(kind, error = %e, "Break-glass notification failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AllowedUser;
    use ed25519_dalek::{Signer, SigningKey};

    struct FakeProvisioner {
        roles: Mutex<Vec<String>>,
        dropped: Mutex<Vec<String>>,
    }

    impl FakeProvisioner {
        fn new() -> Self {
            Self {
                roles: Mutex::new(Vec::new()),
                dropped: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait::async_trait]
    impl DbProvisioner for FakeProvisioner {
        async fn create_role(&self, username: &str, _password: &str, _level: AccessLevel) -> Result<()> {
            validate_username(username)?;
            self.roles.lock().push(username.to_string());
            Ok(())
        }

        async fn drop_role(&self, username: &str) -> Result<()> {
            self.dropped.lock().push(username.to_string());
            Ok(())
        }

        async fn session_stats(&self, _username: &str) -> Result<SessionStats> {
            Ok(SessionStats {
                query_count: 7,
                tables_accessed: vec!["orders".to_string()],
                operation_counts: [("SELECT".to_string(), 7)].into_iter().collect(),
            })
        }
    }

    struct Fixture {
        manager: Arc<BreakGlassManager>,
        audit: Arc<MemoryAuditSink>,
        provisioner: Arc<FakeProvisioner>,
        signing: SigningKey,
        _dir: tempfile::TempDir,
    }

    fn manager_with_user(name: &str) -> Fixture {
        let signing = SigningKey::generate(&mut rand::rngs::OsRng);
        let dir = tempfile::tempdir().unwrap();
        let config = BreakGlassConfig {
            enabled: true,
            allowed_users: vec![AllowedUser {
                name: name.to_string(),
                public_key: hex::encode(signing.verifying_key().as_bytes()),
            }],
            recording_path: dir.path().join("recordings"),
            max_duration_secs: 600,
            ..Default::default()
        };
        let audit = Arc::new(MemoryAuditSink::default());
        let provisioner = Arc::new(FakeProvisioner::new());
        let manager = BreakGlassManager::new(
            config,
            "node-1",
            provisioner.clone() as Arc<dyn DbProvisioner>,
            audit.clone() as Arc<dyn AuditSink>,
            None,
        )
        .unwrap();
        Fixture {
            manager: Arc::new(manager),
            audit,
            provisioner,
            signing,
            _dir: dir,
        }
    }

    #[test]
    fn test_username_validation() {
        assert!(validate_username("breakglass_a1B2c3D4").is_ok());
        assert!(validate_username("breakglass_").is_err());
        assert!(validate_username("admin").is_err());
        assert!(validate_username("breakglass_has-dash").is_err());
        assert!(validate_username("breakglass_x; DROP TABLE users").is_err());
        assert!(validate_username(&format!("breakglass_{}", "a".repeat(33))).is_err());
    }

    #[test]
    fn test_grants_never_touch_audit_log() {
        let tables = ["orders", "audit_log", "users"];
        for level in [AccessLevel::ReadOnly, AccessLevel::ReadWrite] {
            let statements = grant_statements("breakglass_abcd1234", level, &tables).unwrap();
            for stmt in &statements {
                assert!(
                    !stmt.starts_with("GRANT") || !stmt.contains("audit_log"),
                    "audit_log must never appear in a grant: {stmt}"
                );
            }
            assert!(statements
                .last()
                .unwrap()
                .starts_with("REVOKE ALL ON public.audit_log"));
        }
    }

    #[test]
    fn test_challenge_flow() {
        let Fixture {
            manager, signing, ..
        } = manager_with_user("alice");

        // Unknown users are refused outright.
        assert!(matches!(
            manager.create_challenge("mallory").unwrap_err(),
            BibError::Unauthorized
        ));

        let challenge = manager.create_challenge("alice").unwrap();
        assert_eq!(challenge.nonce.len(), 32);

        let signature = signing.sign(&challenge.nonce);
        manager
            .verify_challenge(&challenge.id, &signature.to_bytes())
            .unwrap();

        // Single use: the same challenge cannot be verified twice.
        assert!(matches!(
            manager
                .verify_challenge(&challenge.id, &signature.to_bytes())
                .unwrap_err(),
            BibError::NotFound(_)
        ));
    }

    #[test]
    fn test_challenge_rejects_wrong_key() {
        let Fixture { manager, .. } = manager_with_user("alice");
        let challenge = manager.create_challenge("alice").unwrap();

        let wrong = SigningKey::generate(&mut rand::rngs::OsRng);
        let signature = wrong.sign(&challenge.nonce);
        assert!(matches!(
            manager
                .verify_challenge(&challenge.id, &signature.to_bytes())
                .unwrap_err(),
            BibError::Unauthorized
        ));
    }

    #[tokio::test]
    async fn test_session_lifecycle_end_to_end() {
        let Fixture {
            manager,
            audit,
            provisioner,
            ..
        } = manager_with_user("alice");

        let credentials = manager
            .enable(
                "alice",
                "investigation",
                Duration::from_secs(600),
                "oncall",
                Some(AccessLevel::ReadOnly),
            )
            .await
            .unwrap();
        assert!(credentials.db_user.starts_with("breakglass_"));
        assert_eq!(credentials.db_password.len(), 32);
        assert_eq!(
            manager.current_session().unwrap().state,
            SessionState::Active
        );

        // One non-inactive session per node.
        assert!(matches!(
            manager
                .enable("alice", "again", Duration::from_secs(60), "oncall", None)
                .await
                .unwrap_err(),
            BibError::SessionActive
        ));

        manager.record_event(EventKind::Query, "SELECT 1");
        let report = manager.disable("oncall").await.unwrap();
        assert_eq!(report.stats.query_count, 7);
        assert_eq!(manager.pending_reports().len(), 1);
        // The database role is gone before the report exists.
        assert_eq!(provisioner.dropped.lock().as_slice(), &[credentials.db_user.clone()]);

        // Still blocked until acknowledged.
        assert!(matches!(
            manager
                .enable("alice", "again", Duration::from_secs(60), "oncall", None)
                .await
                .unwrap_err(),
            BibError::SessionActive
        ));

        let report = manager.acknowledge(&report.session.id, "lead").await.unwrap();
        assert!(report.acknowledged_at.is_some());
        assert_eq!(report.acknowledged_by.as_deref(), Some("lead"));
        assert!(manager.pending_reports().is_empty());
        assert!(manager.current_session().is_none());

        let kinds: Vec<String> = audit
            .events
            .lock()
            .iter()
            .map(|e| e.kind.clone())
            .collect();
        assert!(kinds.contains(&"session_enabled".to_string()));
        assert!(kinds.contains(&"session_disabled".to_string()));
        assert!(kinds.contains(&"session_acknowledged".to_string()));
    }

    #[tokio::test]
    async fn test_duration_clamped_to_max() {
        let Fixture { manager, .. } = manager_with_user("alice");
        let credentials = manager
            .enable(
                "alice",
                "reason",
                Duration::from_secs(24 * 3600),
                "oncall",
                None,
            )
            .await
            .unwrap();
        let lifetime = credentials.session.expires_at - credentials.session.started_at;
        assert!(lifetime.num_seconds() <= 600);
    }

    #[tokio::test]
    async fn test_expiry_auto_disables() {
        let Fixture { manager, audit, .. } = manager_with_user("alice");
        manager
            .enable(
                "alice",
                "reason",
                Duration::from_millis(50),
                "oncall",
                None,
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        let session = manager.current_session().unwrap();
        assert_eq!(session.state, SessionState::Expired);
        assert_eq!(manager.pending_reports().len(), 1);

        let kinds: Vec<String> = audit
            .events
            .lock()
            .iter()
            .map(|e| e.kind.clone())
            .collect();
        assert!(kinds.contains(&"session_expired".to_string()));
    }

    #[tokio::test]
    async fn test_disabled_config_refuses() {
        let Fixture { manager, .. } = manager_with_user("alice");
        let mut config = manager.config.clone();
        config.enabled = false;
        let disabled = Arc::new(
            BreakGlassManager::new(
                config,
                "node-1",
                Arc::new(FakeProvisioner::new()),
                Arc::new(MemoryAuditSink::default()) as Arc<dyn AuditSink>,
                None,
            )
            .unwrap(),
        );
        assert!(disabled
            .enable("alice", "reason", Duration::from_secs(60), "oncall", None)
            .await
            .is_err());
    }
}

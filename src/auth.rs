use std::time::Duration;

use tokio::time::Instant;

use crate::errors::{Result, SessionError};
use crate::messages::{
    AccountAuthReq, ApplicationAuthReq, OutboundMessage, RefreshTokenReq, RefreshTokenRes,
};
use crate::types::AccountId;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    AppAuthPending,
    AppAuthed,
    AccountAuthPending,
    AccountAuthed,
    TokenExpiring,
    RefreshPending,
}

#[derive(Clone)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub account: AccountId,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .field("account", &self.account)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .finish_non_exhaustive()
    }
}

/// Sequences application auth, account auth and token refresh.
///
/// The machine is pure: it hands out the message to send and expects the
/// caller to report the outcome. Timeouts and retries belong to the request
/// correlator.
#[derive(Debug)]
pub struct AuthStateMachine {
    state: AuthState,
    credentials: Credentials,
    expires_at: Option<Instant>,
    lifetime: Duration,
    refresh_margin: Duration,
    authenticated: Option<AccountId>,
}

impl AuthStateMachine {
    pub fn new(credentials: Credentials, lifetime: Duration, refresh_margin: Duration) -> Self {
        Self {
            state: AuthState::Unauthenticated,
            credentials,
            expires_at: None,
            lifetime,
            refresh_margin,
            authenticated: None,
        }
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    pub fn account(&self) -> AccountId {
        self.credentials.account
    }

    pub fn authenticated_account(&self) -> Option<AccountId> {
        self.authenticated
    }

    pub fn expires_at(&self) -> Option<Instant> {
        self.expires_at
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(
            self.state,
            AuthState::AccountAuthed | AuthState::TokenExpiring | AuthState::RefreshPending
        )
    }

    fn transition(&mut self, from: &[AuthState], to: AuthState) -> Result<()> {
        if !from.contains(&self.state) {
            return Err(SessionError::Protocol(format!(
                "auth transition {:?} -> {:?} not allowed",
                self.state, to
            )));
        }
        tracing::debug!(from = ?self.state, to = ?to, account = %self.credentials.account, "auth_transition");
        self.state = to;
        Ok(())
    }

    pub fn begin_app_auth(&mut self) -> Result<OutboundMessage> {
        self.transition(&[AuthState::Unauthenticated], AuthState::AppAuthPending)?;
        Ok(OutboundMessage::ApplicationAuth(ApplicationAuthReq {
            client_id: self.credentials.client_id.clone(),
            client_secret: self.credentials.client_secret.clone(),
        }))
    }

    pub fn app_auth_succeeded(&mut self) -> Result<()> {
        self.transition(&[AuthState::AppAuthPending], AuthState::AppAuthed)
    }

    pub fn begin_account_auth(&mut self) -> Result<OutboundMessage> {
        self.transition(&[AuthState::AppAuthed], AuthState::AccountAuthPending)?;
        Ok(OutboundMessage::AccountAuth(AccountAuthReq {
            ctid_trader_account_id: self.credentials.account,
            access_token: self.credentials.access_token.clone(),
        }))
    }

    pub fn account_auth_succeeded(&mut self, account: AccountId, now: Instant) -> Result<()> {
        if account != self.credentials.account {
            return Err(SessionError::Protocol(format!(
                "account auth response for {account}, expected {}",
                self.credentials.account
            )));
        }
        self.transition(&[AuthState::AccountAuthPending], AuthState::AccountAuthed)?;
        self.authenticated = Some(account);
        if self.expires_at.is_none() {
            // Past the clock's range means the token never needs refreshing.
            self.expires_at = now.checked_add(self.lifetime);
        }
        Ok(())
    }

    /// When the refresh should start; `None` without a refresh token.
    pub fn refresh_deadline(&self) -> Option<Instant> {
        if self.state != AuthState::AccountAuthed || self.credentials.refresh_token.is_none() {
            return None;
        }
        self.expires_at
            .map(|expiry| expiry.checked_sub(self.refresh_margin).unwrap_or(expiry))
    }

    pub fn begin_refresh(&mut self) -> Result<Option<OutboundMessage>> {
        let Some(refresh_token) = self.credentials.refresh_token.clone() else {
            return Ok(None);
        };
        self.transition(&[AuthState::AccountAuthed], AuthState::TokenExpiring)?;
        self.transition(&[AuthState::TokenExpiring], AuthState::RefreshPending)?;
        Ok(Some(OutboundMessage::RefreshToken(RefreshTokenReq {
            refresh_token,
        })))
    }

    pub fn refresh_succeeded(&mut self, res: RefreshTokenRes, now: Instant) -> Result<()> {
        self.transition(&[AuthState::RefreshPending], AuthState::AccountAuthed)?;
        self.credentials.access_token = res.access_token;
        self.credentials.refresh_token = Some(res.refresh_token);
        self.expires_at = now.checked_add(Duration::from_secs(res.expires_in));
        tracing::info!(account = %self.credentials.account, expires_in = res.expires_in, "token_refreshed");
        Ok(())
    }

    /// Failure in any pending state returns to `Unauthenticated`.
    pub fn fail(&mut self, reason: &str) -> AuthState {
        let previous = self.state;
        tracing::warn!(from = ?previous, account = %self.credentials.account, reason, "auth_failed");
        self.state = AuthState::Unauthenticated;
        self.authenticated = None;
        previous
    }

    /// Returns true if `account` is the active account and it was revoked.
    pub fn revoke(&mut self, account: AccountId) -> bool {
        if account != self.credentials.account {
            return false;
        }
        tracing::warn!(account = %account, from = ?self.state, "auth_revoked");
        self.state = AuthState::Unauthenticated;
        self.authenticated = None;
        true
    }

    /// Connection loss keeps credentials and expiry but drops the auth state.
    pub fn reset(&mut self) {
        self.state = AuthState::Unauthenticated;
        self.authenticated = None;
    }

    pub fn can_send(&self, message: &OutboundMessage) -> bool {
        if !message.is_pre_auth() {
            return self.is_authenticated();
        }
        match message {
            OutboundMessage::ApplicationAuth(_) => self.state == AuthState::AppAuthPending,
            OutboundMessage::AccountAuth(_) => self.state == AuthState::AccountAuthPending,
            OutboundMessage::RefreshToken(_) => self.state == AuthState::RefreshPending,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(refresh: bool) -> AuthStateMachine {
        AuthStateMachine::new(
            Credentials {
                client_id: "id".into(),
                client_secret: "secret".into(),
                access_token: "token".into(),
                refresh_token: refresh.then(|| "refresh".to_string()),
                account: AccountId::new(7),
            },
            Duration::from_secs(3600),
            Duration::from_secs(300),
        )
    }

    fn authed(machine: &mut AuthStateMachine, now: Instant) {
        machine.begin_app_auth().unwrap();
        machine.app_auth_succeeded().unwrap();
        machine.begin_account_auth().unwrap();
        machine
            .account_auth_succeeded(AccountId::new(7), now)
            .unwrap();
    }

    #[test]
    fn full_login_sequence_gates_sending() {
        let now = Instant::now();
        let mut auth = machine(true);
        let reconcile = OutboundMessage::Reconcile(crate::messages::AccountReq {
            ctid_trader_account_id: AccountId::new(7),
        });
        assert!(!auth.can_send(&reconcile));

        let app = auth.begin_app_auth().unwrap();
        assert!(auth.can_send(&app));
        assert!(!auth.can_send(&reconcile));
        auth.app_auth_succeeded().unwrap();
        auth.begin_account_auth().unwrap();
        auth.account_auth_succeeded(AccountId::new(7), now).unwrap();

        assert!(auth.is_authenticated());
        assert!(auth.can_send(&reconcile));
        assert_eq!(
            auth.refresh_deadline(),
            Some(now + Duration::from_secs(3300))
        );
    }

    #[test]
    fn out_of_order_transition_is_rejected() {
        let mut auth = machine(false);
        assert!(auth.begin_account_auth().is_err());
        assert_eq!(auth.state(), AuthState::Unauthenticated);
    }

    #[test]
    fn refresh_cycle_keeps_session_authenticated() {
        let now = Instant::now();
        let mut auth = machine(true);
        authed(&mut auth, now);

        let req = auth.begin_refresh().unwrap().unwrap();
        assert!(auth.can_send(&req));
        assert!(auth.is_authenticated());
        assert_eq!(auth.refresh_deadline(), None);

        auth.refresh_succeeded(
            RefreshTokenRes {
                access_token: "new".into(),
                expires_in: 7200,
                refresh_token: "new-refresh".into(),
            },
            now,
        )
        .unwrap();
        assert_eq!(auth.state(), AuthState::AccountAuthed);
        assert_eq!(auth.expires_at(), Some(now + Duration::from_secs(7200)));
    }

    #[test]
    fn oversized_token_lifetime_never_schedules_refresh() {
        let now = Instant::now();
        let mut auth = machine(true);
        authed(&mut auth, now);

        auth.begin_refresh().unwrap().unwrap();
        auth.refresh_succeeded(
            RefreshTokenRes {
                access_token: "new".into(),
                expires_in: u64::MAX,
                refresh_token: "new-refresh".into(),
            },
            now,
        )
        .unwrap();
        assert!(auth.is_authenticated());
        assert_eq!(auth.expires_at(), None);
        assert_eq!(auth.refresh_deadline(), None);

        let mut forever = AuthStateMachine::new(
            auth.credentials.clone(),
            Duration::MAX,
            Duration::from_secs(300),
        );
        authed(&mut forever, now);
        assert_eq!(forever.refresh_deadline(), None);
    }

    #[test]
    fn setup_messages_are_gated_by_their_own_step() {
        let mut auth = machine(true);
        assert!(auth.can_send(&OutboundMessage::Heartbeat));
        let app = auth.begin_app_auth().unwrap();
        auth.app_auth_succeeded().unwrap();
        assert!(!auth.can_send(&app));
        let account = auth.begin_account_auth().unwrap();
        assert!(auth.can_send(&account));
        auth.account_auth_succeeded(AccountId::new(7), Instant::now())
            .unwrap();
        assert!(!auth.can_send(&account));
        assert!(auth.can_send(&OutboundMessage::Heartbeat));
    }

    #[test]
    fn refresh_without_token_is_skipped() {
        let mut auth = machine(false);
        authed(&mut auth, Instant::now());
        assert!(auth.refresh_deadline().is_none());
        assert!(auth.begin_refresh().unwrap().is_none());
    }

    #[test]
    fn revoke_only_affects_active_account() {
        let mut auth = machine(false);
        authed(&mut auth, Instant::now());
        assert!(!auth.revoke(AccountId::new(8)));
        assert!(auth.is_authenticated());
        assert!(auth.revoke(AccountId::new(7)));
        assert_eq!(auth.state(), AuthState::Unauthenticated);
    }

    #[test]
    fn failure_in_pending_state_returns_to_unauthenticated() {
        let mut auth = machine(false);
        auth.begin_app_auth().unwrap();
        assert_eq!(auth.fail("timeout"), AuthState::AppAuthPending);
        assert_eq!(auth.state(), AuthState::Unauthenticated);
    }
}

//! # Accounts
//!
//! Signup, login, session revocation and per-user settings. Sessions are
//! stateless tokens; the only server-side handle on them is the user's
//! session nonce, which every login and logout rotates.

use std::sync::Arc;

use chrono::Utc;
use domains::{
    Applied, Challenge, CredentialHasher, DomainError, Identifier, IpHistory, RequestContext, Result, Role,
    TokenCodec, UpdateRequest, User, UserSettings, UserUpdate, CUSTOM_NAME_MAX_CHARS, DESCRIPTION_MAX_CHARS,
    EMAIL_MAX_CHARS,
};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::dispatcher::UpdateDispatcher;
use crate::store::AggregateStore;
use crate::text::{sanitize_username, soft_trunc, IpHasher};

pub const MIN_USERNAME_CHARS: usize = 3;
pub const MIN_PASSWORD_CHARS: usize = 3;
pub const PASSWORD_MAX_CHARS: usize = 32;
pub const SIGNUP_EMAIL_MAX_CHARS: usize = 64;

/// Prefixes nobody but the configured admin may register under.
const RESERVED_PREFIXES: [&str; 2] = ["master", "admin"];

#[derive(Debug, Clone)]
pub struct Signup {
    pub username: String,
    pub email: String,
    pub password: String,
    pub ip: String,
    pub challenge_id: String,
    pub challenge_answer: String,
}

/// Settings change; `None` fields are left alone. Applied atomically.
#[derive(Debug, Clone, Default)]
pub struct SettingsChange {
    pub email: Option<String>,
    pub auto_nsfw: Option<bool>,
    pub fold_images: Option<bool>,
    pub description: Option<String>,
    pub custom_name: Option<String>,
    pub avatar: Option<u32>,
}

pub struct AccountService {
    dispatcher: Arc<UpdateDispatcher>,
    tokens: Arc<dyn TokenCodec>,
    hasher: Arc<dyn CredentialHasher>,
    ip: IpHasher,
    admin_name: String,
}

fn new_session() -> String {
    Uuid::new_v4().simple().to_string()
}

fn password_input(raw: &str) -> String {
    soft_trunc(raw, PASSWORD_MAX_CHARS)
}

impl AccountService {
    pub fn new(
        dispatcher: Arc<UpdateDispatcher>,
        tokens: Arc<dyn TokenCodec>,
        hasher: Arc<dyn CredentialHasher>,
        ip: IpHasher,
        admin_name: &str,
    ) -> Self {
        Self { dispatcher, tokens, hasher, ip, admin_name: sanitize_username(admin_name) }
    }

    fn store(&self) -> &AggregateStore {
        self.dispatcher.store()
    }

    pub async fn get_user(&self, name: &str) -> Result<Option<User>> {
        self.store().get_typed(&Identifier::user(name)).await
    }

    async fn require_user(&self, name: &str) -> Result<User> {
        self.get_user(name).await?.ok_or_else(|| DomainError::NotFound("user", name.to_string()))
    }

    async fn update(&self, name: &str, updates: impl IntoIterator<Item = UserUpdate>) -> Result<Applied<User>> {
        let mut req = UpdateRequest::<User>::new(Identifier::user(name));
        req.updates.extend(updates);
        self.dispatcher.apply(&req).await
    }

    fn check_reserved(&self, name: &str) -> Result<()> {
        if name != self.admin_name && RESERVED_PREFIXES.iter().any(|p| name.starts_with(p)) {
            return Err(DomainError::conflict(format!("{name} already exists")));
        }
        Ok(())
    }

    /// Registers a new account and returns it with a session token.
    #[instrument(skip_all, fields(username = %req.username))]
    pub async fn signup(&self, req: Signup) -> Result<(User, String)> {
        let name = sanitize_username(&req.username);
        let password = password_input(&req.password);
        if name.chars().count() < MIN_USERNAME_CHARS {
            return Err(DomainError::validation(format!("username needs at least {MIN_USERNAME_CHARS} characters")));
        }
        if password.chars().count() < MIN_PASSWORD_CHARS {
            return Err(DomainError::validation(format!("password needs at least {MIN_PASSWORD_CHARS} characters")));
        }

        let ip_hash = self.ip.hash(&req.ip);
        self.tokens.verify_challenge(&req.challenge_id, &req.challenge_answer, &ip_hash)?;
        self.check_reserved(&name)?;

        let now = Utc::now();
        let user = User {
            id: name.clone(),
            session: new_session(),
            email: soft_trunc(&req.email, SIGNUP_EMAIL_MAX_CHARS),
            password_hash: self.hasher.hash(&password)?,
            recent_ips: IpHistory::with_anchor(ip_hash),
            signup_at: now,
            login_at: now,
            kimochi: 0,
            settings: UserSettings::default(),
            avatar: 0,
            role: if name == self.admin_name { Role::Admin } else { Role::User },
            banned: false,
            followers: 0,
            unread_mentions: 0,
        };

        let created = self.dispatcher.create(&user.key(), user).await?.value;
        let token = self.tokens.make_user_token(&created);
        info!(user = %created.id, role = ?created.role, "signed up");
        Ok((created, token))
    }

    /// Checks the password, rotates the session and records the address.
    #[instrument(skip_all, fields(username = tracing::field::Empty))]
    pub async fn login(&self, username: &str, password: &str, ip: &str) -> Result<(User, String)> {
        let name = sanitize_username(username);
        tracing::Span::current().record("username", name.as_str());

        let user = self.require_user(&name).await?;
        if !self.hasher.verify(&password_input(password), &user.password_hash) {
            warn!("wrong password");
            return Err(DomainError::conflict("password mismatch"));
        }

        let applied = self
            .update(
                &name,
                [
                    UserUpdate::RotateSession(new_session()),
                    UserUpdate::SetLoginAt(Utc::now()),
                    UserUpdate::RecordIp(self.ip.hash(ip)),
                ],
            )
            .await?;
        info!("logged in");
        let token = self.tokens.make_user_token(&applied.value);
        Ok((applied.value, token))
    }

    /// Revokes every token issued so far for `user_id`.
    #[instrument(skip(self))]
    pub async fn logout(&self, user_id: &str) -> Result<()> {
        self.update(user_id, [UserUpdate::RotateSession(new_session())]).await?;
        info!("logged out");
        Ok(())
    }

    #[instrument(skip(self, old, new))]
    pub async fn change_password(&self, user_id: &str, old: &str, new: &str) -> Result<()> {
        let new = password_input(new);
        if new.chars().count() < MIN_PASSWORD_CHARS {
            return Err(DomainError::validation(format!("password needs at least {MIN_PASSWORD_CHARS} characters")));
        }
        let user = self.require_user(user_id).await?;
        if !self.hasher.verify(&password_input(old), &user.password_hash) {
            return Err(DomainError::conflict("password mismatch"));
        }
        self.update(user_id, [UserUpdate::SetPasswordHash(self.hasher.hash(&new)?)]).await?;
        info!("password changed");
        Ok(())
    }

    /// Out-of-range moods are rejected by the dispatcher, not clamped.
    pub async fn set_kimochi(&self, user_id: &str, kimochi: i64) -> Result<User> {
        Ok(self.update(user_id, [UserUpdate::SetKimochi(kimochi)]).await?.value)
    }

    #[instrument(skip_all, fields(user = %actor.id))]
    pub async fn update_settings(&self, actor: &User, change: SettingsChange) -> Result<User> {
        let mut updates = Vec::new();
        if let Some(email) = change.email {
            updates.push(UserUpdate::SetEmail(soft_trunc(&email, EMAIL_MAX_CHARS)));
        }
        if let Some(v) = change.auto_nsfw {
            updates.push(UserUpdate::SetAutoNsfw(v));
        }
        if let Some(v) = change.fold_images {
            updates.push(UserUpdate::SetFoldImages(v));
        }
        if let Some(text) = change.description {
            updates.push(UserUpdate::SetDescription(soft_trunc(&text, DESCRIPTION_MAX_CHARS)));
        }
        if let Some(mut name) = change.custom_name {
            if !actor.is_admin() && name.to_lowercase().contains("admin") {
                name = name.replace("admin", "nimda");
            }
            updates.push(UserUpdate::SetCustomName(soft_trunc(&name, CUSTOM_NAME_MAX_CHARS)));
        }
        if let Some(stamp) = change.avatar {
            updates.push(UserUpdate::SetAvatar(stamp));
        }
        Ok(self.update(&actor.id, updates).await?.value)
    }

    pub async fn clear_mentions(&self, user_id: &str) -> Result<User> {
        Ok(self.update(user_id, [UserUpdate::ClearUnreadMentions]).await?.value)
    }

    /// The caller's identity. Any token or session mismatch is anonymous,
    /// not an error; only store faults surface.
    pub async fn get_user_by_context(&self, ctx: &RequestContext) -> Result<Option<User>> {
        let Some(token) = ctx.session_token.as_deref().filter(|t| !t.is_empty()) else {
            return Ok(None);
        };
        let claims = match self.tokens.verify_user_token(token) {
            Ok(claims) => claims,
            Err(err) => {
                debug!(error = %err, "session token rejected");
                return Ok(None);
            }
        };
        Ok(self
            .store()
            .get_typed::<User>(&Identifier::user(&claims.user_id))
            .await?
            .filter(|user| !user.session.is_empty() && user.session == claims.session))
    }

    pub fn new_captcha(&self, ctx: &RequestContext) -> Challenge {
        self.tokens.make_challenge(&self.ip.hash(&ctx.ip))
    }

    pub fn verify_captcha(&self, ctx: &RequestContext, challenge_id: &str, answer: &str) -> Result<()> {
        self.tokens.verify_challenge(challenge_id, answer, &self.ip.hash(&ctx.ip))
    }

    /// Admins only.
    #[instrument(skip_all, fields(actor = %actor.id, subject = target, ?role))]
    pub async fn set_role(&self, actor: &User, target: &str, role: Role) -> Result<User> {
        if !actor.is_admin() {
            return Err(DomainError::validation(format!("{} may not change roles", actor.id)));
        }
        let user = self.update(target, [UserUpdate::SetRole(role)]).await?.value;
        info!("role changed");
        Ok(user)
    }

    /// Moderators and admins; nobody can ban themselves or an admin.
    #[instrument(skip_all, fields(actor = %actor.id, subject = target, banned))]
    pub async fn set_banned(&self, actor: &User, target: &str, banned: bool) -> Result<User> {
        if !actor.is_moderator() || actor.id == target {
            return Err(DomainError::validation(format!("{} may not ban {target}", actor.id)));
        }
        if self.require_user(target).await?.is_admin() {
            return Err(DomainError::validation("admins cannot be banned"));
        }
        let user = self.update(target, [UserUpdate::SetBanned(banned)]).await?.value;
        info!("ban flag changed");
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::memory_dispatcher;
    use domains::{MockCredentialHasher, MockTokenCodec, SessionClaims};

    fn signup(name: &str) -> Signup {
        Signup {
            username: name.to_string(),
            email: "a@example.com".to_string(),
            password: "hunter2".to_string(),
            ip: "10.0.0.1".to_string(),
            challenge_id: "cid".to_string(),
            challenge_answer: "1234".to_string(),
        }
    }

    /// Plain-text hasher so tests stay fast and readable.
    fn hasher() -> MockCredentialHasher {
        let mut h = MockCredentialHasher::new();
        h.expect_hash().returning(|p| Ok(format!("h:{p}")));
        h.expect_verify().returning(|p, hash| hash == format!("h:{p}"));
        h
    }

    /// Token codec whose tokens are `user|session`.
    fn tokens() -> MockTokenCodec {
        let mut t = MockTokenCodec::new();
        t.expect_verify_challenge().returning(|_, answer, _| {
            if answer == "1234" {
                Ok(())
            } else {
                Err(DomainError::forged("bad captcha"))
            }
        });
        t.expect_make_user_token().returning(|u| format!("{}|{}", u.id, u.session));
        t.expect_verify_user_token().returning(|tok| {
            let (user_id, session) = tok.split_once('|').ok_or_else(|| DomainError::forged("malformed"))?;
            Ok(SessionClaims { user_id: user_id.into(), session: session.into(), expires_at: i64::MAX })
        });
        t
    }

    fn service_with(tokens: MockTokenCodec) -> AccountService {
        let (_, dispatcher) = memory_dispatcher();
        AccountService::new(dispatcher, Arc::new(tokens), Arc::new(hasher()), IpHasher::new(b"k").unwrap(), "Root")
    }

    fn service() -> AccountService {
        service_with(tokens())
    }

    fn ctx(token: &str) -> RequestContext {
        RequestContext { session_token: Some(token.to_string()), ip: "10.0.0.1".to_string() }
    }

    #[tokio::test]
    async fn signup_then_login_rotates_session() {
        let svc = service();
        let (alice, first) = svc.signup(signup("  Alice ")).await.unwrap();
        assert_eq!(alice.id, "alice");
        assert_eq!(alice.password_hash, "h:hunter2");
        assert_eq!(alice.recent_ips.len(), 1);
        assert_eq!(alice.role, Role::User);
        assert_eq!(svc.get_user_by_context(&ctx(&first)).await.unwrap().unwrap().id, "alice");

        let (again, second) = svc.login("ALICE", "hunter2", "10.0.0.2").await.unwrap();
        assert_ne!(again.session, alice.session);
        assert_eq!(again.recent_ips.len(), 2);
        assert_eq!(again.recent_ips.anchor(), alice.recent_ips.anchor());

        assert!(svc.get_user_by_context(&ctx(&first)).await.unwrap().is_none());
        assert!(svc.get_user_by_context(&ctx(&second)).await.unwrap().is_some());

        svc.logout("alice").await.unwrap();
        assert!(svc.get_user_by_context(&ctx(&second)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn signup_rules() {
        let svc = service();
        assert!(matches!(svc.signup(signup("ab")).await, Err(DomainError::Validation(_))));
        assert!(matches!(svc.signup(Signup { password: "  x ".into(), ..signup("carol") }).await, Err(DomainError::Validation(_))));
        assert!(matches!(
            svc.signup(Signup { challenge_answer: "0000".into(), ..signup("carol") }).await,
            Err(DomainError::Forged(_))
        ));
        assert!(matches!(svc.signup(signup("administrator")).await, Err(DomainError::Conflict(_))));
        assert!(matches!(svc.signup(signup("master_x")).await, Err(DomainError::Conflict(_))));

        svc.signup(signup("carol")).await.unwrap();
        assert!(matches!(svc.signup(signup("CAROL")).await, Err(DomainError::Conflict(_))));
    }

    #[tokio::test]
    async fn configured_admin_gets_admin_role_once() {
        let svc = service();
        let (root, _) = svc.signup(signup("root")).await.unwrap();
        assert!(root.is_admin());
        assert!(matches!(svc.signup(signup("root")).await, Err(DomainError::Conflict(_))));
    }

    #[tokio::test]
    async fn login_failures() {
        let svc = service();
        svc.signup(signup("alice")).await.unwrap();
        assert!(matches!(svc.login("bob", "hunter2", "ip").await, Err(DomainError::NotFound("user", _))));
        assert!(matches!(svc.login("alice", "wrong", "ip").await, Err(DomainError::Conflict(_))));
    }

    #[tokio::test]
    async fn change_password_checks_old_one() {
        let svc = service();
        svc.signup(signup("alice")).await.unwrap();
        assert!(matches!(svc.change_password("alice", "nope", "newpass").await, Err(DomainError::Conflict(_))));
        assert!(matches!(svc.change_password("alice", "hunter2", "no").await, Err(DomainError::Validation(_))));
        svc.change_password("alice", "hunter2", "newpass").await.unwrap();
        svc.login("alice", "newpass", "ip").await.unwrap();
    }

    #[tokio::test]
    async fn kimochi_bounds() {
        let svc = service();
        svc.signup(signup("alice")).await.unwrap();
        assert_eq!(svc.set_kimochi("alice", 44).await.unwrap().kimochi, 44);
        assert!(matches!(svc.set_kimochi("alice", 45).await, Err(DomainError::Validation(_))));
        assert!(matches!(svc.set_kimochi("alice", -1).await, Err(DomainError::Validation(_))));
        assert_eq!(svc.get_user("alice").await.unwrap().unwrap().kimochi, 44);
    }

    #[tokio::test]
    async fn settings_apply_together_and_custom_name_is_guarded() {
        let svc = service();
        let (alice, _) = svc.signup(signup("alice")).await.unwrap();

        let change = SettingsChange {
            email: Some("new@example.com".into()),
            fold_images: Some(true),
            description: Some("d".repeat(600)),
            custom_name: Some("the admin".into()),
            ..SettingsChange::default()
        };
        let updated = svc.update_settings(&alice, change).await.unwrap();
        assert_eq!(updated.email, "new@example.com");
        assert!(updated.settings.fold_images);
        assert_eq!(updated.settings.description.chars().count(), DESCRIPTION_MAX_CHARS);
        assert_eq!(updated.settings.custom_name, "the nimda");
        assert_eq!(updated.display_name(), "the nimda");
    }

    #[tokio::test]
    async fn garbage_tokens_are_anonymous() {
        let svc = service();
        assert!(svc.get_user_by_context(&RequestContext::default()).await.unwrap().is_none());
        assert!(svc.get_user_by_context(&ctx("garbage")).await.unwrap().is_none());
        assert!(svc.get_user_by_context(&ctx("ghost|s")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn captcha_is_bound_to_hashed_ip() {
        let expected = IpHasher::new(b"k").unwrap().hash("10.0.0.1");
        let mut t = MockTokenCodec::new();
        t.expect_make_challenge()
            .withf(move |context| context.to_string() == expected)
            .times(1)
            .returning(|_| Challenge { id: "cid".into(), text: "1234".into() });
        let svc = service_with(t);
        assert_eq!(svc.new_captcha(&ctx("")).id, "cid");
    }

    #[tokio::test]
    async fn roles_and_bans_need_privileges() {
        let svc = service();
        let (root, _) = svc.signup(signup("root")).await.unwrap();
        let (alice, _) = svc.signup(signup("alice")).await.unwrap();
        svc.signup(signup("bob")).await.unwrap();

        assert!(matches!(svc.set_role(&alice, "bob", Role::Admin).await, Err(DomainError::Validation(_))));
        assert!(matches!(svc.set_banned(&alice, "bob", true).await, Err(DomainError::Validation(_))));

        let alice = svc.set_role(&root, "alice", Role::Moderator).await.unwrap();
        assert!(svc.set_banned(&alice, "bob", true).await.unwrap().banned);
        assert!(matches!(svc.set_banned(&alice, "root", true).await, Err(DomainError::Validation(_))));
    }
}

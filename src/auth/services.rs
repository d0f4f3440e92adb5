use lazy_static::lazy_static;
use regex::Regex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    auth::{
        dto::{RegisterRequest, UpdateProfileRequest},
        oauth::ProviderProfile,
        password::{hash_password, verify_password, MIN_PASSWORD_LEN},
        repo::RepoError,
        repo_types::{NewUser, ProfileChanges, User},
    },
    error::AppError,
    state::AppState,
};

const INVALID_CREDENTIALS: &str = "Invalid email or password";

/// A freshly minted bearer token together with its owner.
#[derive(Debug)]
pub struct Issued {
    pub access_token: String,
    pub user: User,
}

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        // printable ASCII only, so Rust and Postgres agree on lowercasing
        static ref EMAIL_RE: Regex =
            Regex::new(r"^[!-?A-~]+@[!-?A-~]+\.[!-?A-~]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn non_blank(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// Absent keeps the stored value; a blank string clears it.
fn clearable(v: Option<String>) -> Option<Option<String>> {
    v.map(|s| non_blank(Some(s)))
}

/// New session entry plus a token that names it.
async fn issue(st: &AppState, user: User) -> Result<Issued, AppError> {
    let session_id = st.sessions.create(user.id).await?;
    let access_token = st.jwt.sign(user.id, &user.email, session_id)?;
    Ok(Issued { access_token, user })
}

pub async fn register(st: &AppState, req: RegisterRequest) -> Result<Issued, AppError> {
    let email = normalize_email(&req.email);
    if !is_valid_email(&email) {
        warn!(email = %email, "invalid email");
        return Err(AppError::validation("Invalid email address"));
    }
    if req.password.chars().count() < MIN_PASSWORD_LEN {
        warn!("password too short");
        return Err(AppError::validation(format!(
            "Password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    let first_name = req.first_name.trim().to_string();
    if first_name.is_empty() {
        return Err(AppError::validation("First name is required"));
    }

    if st.users.find_by_email(&email).await?.is_some() {
        warn!(email = %email, "email already registered");
        return Err(AppError::Conflict("User with this email already exists".into()));
    }

    let password_hash = hash_password(&req.password)?;
    // a concurrent registration can still win the unique index; From<RepoError> maps it to Conflict
    let user = st
        .users
        .create(NewUser {
            email,
            password_hash: Some(password_hash),
            google_id: None,
            first_name,
            last_name: non_blank(req.last_name),
            avatar_url: None,
        })
        .await?;

    info!(user_id = %user.id, email = %user.email, "user registered");
    issue(st, user).await
}

pub async fn login(st: &AppState, email: &str, password: &str) -> Result<Issued, AppError> {
    let email = normalize_email(email);
    if email.is_empty() || password.is_empty() {
        return Err(AppError::validation("Email and password are required"));
    }

    let Some(user) = st.users.find_by_email(&email).await? else {
        warn!(email = %email, "login unknown email");
        return Err(AppError::auth(INVALID_CREDENTIALS));
    };
    let Some(hash) = user.password_hash.as_deref() else {
        warn!(user_id = %user.id, "login against account without password");
        return Err(AppError::auth(INVALID_CREDENTIALS));
    };
    if !verify_password(password, hash)? {
        warn!(user_id = %user.id, "login invalid password");
        return Err(AppError::auth(INVALID_CREDENTIALS));
    }
    if !user.is_active {
        warn!(user_id = %user.id, "login to deactivated account");
        return Err(AppError::auth("Account is deactivated"));
    }

    info!(user_id = %user.id, email = %user.email, "user logged in");
    issue(st, user).await
}

/// Resolve a provider profile to a local account: by provider id, then by
/// email (linking the provider id), else a new password-less account.
pub async fn login_with_provider(
    st: &AppState,
    profile: ProviderProfile,
) -> Result<Issued, AppError> {
    let Some(email) = profile.email.as_deref().map(normalize_email) else {
        warn!(provider_id = %profile.provider_id, "provider returned no email");
        return Err(AppError::auth("No email provided by Google"));
    };
    if !is_valid_email(&email) {
        warn!(provider_id = %profile.provider_id, "provider returned unusable email");
        return Err(AppError::auth("Invalid email provided by Google"));
    }

    let user = match st.users.find_by_google_id(&profile.provider_id).await? {
        Some(user) => user,
        None => match st.users.find_by_email(&email).await? {
            Some(existing) => {
                if !existing.is_active {
                    warn!(user_id = %existing.id, "google link to deactivated account");
                    return Err(AppError::auth("Account is deactivated"));
                }
                let linked = st
                    .users
                    .link_google(
                        existing.id,
                        &profile.provider_id,
                        profile.avatar_url.as_deref(),
                    )
                    .await?;
                info!(user_id = %linked.id, "google account linked");
                linked
            }
            None => {
                let created = create_from_profile(st, &email, &profile).await?;
                info!(user_id = %created.id, email = %created.email, "user registered via google");
                created
            }
        },
    };

    if !user.is_active {
        warn!(user_id = %user.id, "google login to deactivated account");
        return Err(AppError::auth("Account is deactivated"));
    }

    info!(user_id = %user.id, "user logged in via google");
    issue(st, user).await
}

async fn create_from_profile(
    st: &AppState,
    email: &str,
    profile: &ProviderProfile,
) -> Result<User, AppError> {
    let first_name = non_blank(profile.first_name.clone())
        .or_else(|| non_blank(profile.display_name.clone()))
        .unwrap_or_else(|| email.split('@').next().unwrap_or(email).to_string());

    let new = NewUser {
        email: email.to_string(),
        password_hash: None,
        google_id: Some(profile.provider_id.clone()),
        first_name,
        last_name: non_blank(profile.last_name.clone()),
        avatar_url: profile.avatar_url.clone(),
    };

    match st.users.create(new).await {
        Ok(user) => Ok(user),
        // lost a race against a concurrent first login with the same account
        Err(RepoError::Duplicate(_)) => st
            .users
            .find_by_google_id(&profile.provider_id)
            .await?
            .ok_or_else(|| AppError::Conflict("User with this email already exists".into())),
        Err(e) => Err(e.into()),
    }
}

pub async fn logout(st: &AppState, user_id: Uuid, session_id: Uuid) -> Result<(), AppError> {
    st.sessions.revoke(session_id).await?;
    info!(%user_id, %session_id, "user logged out");
    Ok(())
}

pub async fn current_user(st: &AppState, user_id: Uuid) -> Result<User, AppError> {
    st.users
        .find_by_id(user_id)
        .await?
        .filter(|u| u.is_active)
        .ok_or_else(|| AppError::NotFound("User not found".into()))
}

pub async fn update_profile(
    st: &AppState,
    user_id: Uuid,
    req: UpdateProfileRequest,
) -> Result<User, AppError> {
    let first_name = match req.first_name {
        Some(name) if name.trim().is_empty() => {
            return Err(AppError::validation("First name cannot be empty"))
        }
        other => non_blank(other),
    };
    // deactivated accounts are invisible here too
    current_user(st, user_id).await?;

    let changes = ProfileChanges {
        first_name,
        last_name: clearable(req.last_name),
        avatar_url: clearable(req.avatar_url),
    };
    let user = st
        .users
        .update_profile(user_id, changes)
        .await?
        .ok_or_else(|| AppError::NotFound("User not found".into()))?;
    info!(%user_id, "profile updated");
    Ok(user)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{auth::repo::UserRepo, state::testing::TestCtx};

    fn register_req(email: &str, password: &str) -> RegisterRequest {
        RegisterRequest {
            email: email.into(),
            password: password.into(),
            first_name: "A".into(),
            last_name: None,
        }
    }

    fn google_profile(id: &str, email: Option<&str>) -> ProviderProfile {
        ProviderProfile {
            provider_id: id.into(),
            email: email.map(str::to_string),
            first_name: Some("Gee".into()),
            last_name: Some("Oogle".into()),
            display_name: None,
            avatar_url: Some("https://img.test/g.png".into()),
        }
    }

    fn assert_err(err: AppError, expected: &str) {
        assert!(matches!(err, AppError::Auth(ref m) if m == expected), "{err:?}");
    }

    #[test]
    fn email_validation_and_normalization() {
        assert!(is_valid_email("a@b.com"));
        assert!(!is_valid_email("a@b"));
        assert!(!is_valid_email("no at sign.com"));
        assert!(!is_valid_email("ÄBC@b.com"));
        assert!(!is_valid_email("a@bücher.de"));
        assert_eq!(normalize_email("  A@B.Com "), "a@b.com");
    }

    #[tokio::test]
    async fn register_normalizes_email_and_opens_session() {
        let ctx = TestCtx::new();
        let issued = register(&ctx.state, register_req(" A@B.com ", "secret123"))
            .await
            .unwrap();
        assert_eq!(issued.user.email, "a@b.com");
        assert!(issued.user.password_hash.is_some());

        let claims = ctx.state.jwt.verify(&issued.access_token).unwrap();
        assert_eq!(claims.sub, issued.user.id);
        assert_eq!(
            ctx.state.sessions.owner(claims.sid).await.unwrap(),
            Some(issued.user.id)
        );
    }

    #[tokio::test]
    async fn register_validation_errors() {
        let ctx = TestCtx::new();
        let err = register(&ctx.state, register_req("bad-email", "secret123"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let err = register(&ctx.state, register_req("a@b.com", "short"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let mut req = register_req("a@b.com", "secret123");
        req.first_name = "   ".into();
        let err = register(&ctx.state, req).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert_eq!(ctx.users.len(), 0);
    }

    #[tokio::test]
    async fn duplicate_registration_conflicts() {
        let ctx = TestCtx::new();
        register(&ctx.state, register_req("a@b.com", "secret123"))
            .await
            .unwrap();
        let err = register(&ctx.state, register_req("A@b.com", "other-pass"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn concurrent_duplicate_registration_one_wins() {
        let ctx = TestCtx::new();
        let (a, b) = tokio::join!(
            register(&ctx.state, register_req("race@b.com", "secret123")),
            register(&ctx.state, register_req("race@b.com", "secret123")),
        );
        let outcomes = [a.is_ok(), b.is_ok()];
        assert_eq!(outcomes.iter().filter(|ok| **ok).count(), 1);
        let err = a.err().or(b.err()).unwrap();
        assert!(matches!(err, AppError::Conflict(_)));
        assert_eq!(ctx.users.len(), 1);
    }

    #[tokio::test]
    async fn login_failures_share_one_message() {
        let ctx = TestCtx::new();
        register(&ctx.state, register_req("a@b.com", "secret123"))
            .await
            .unwrap();
        login_with_provider(&ctx.state, google_profile("g-only", Some("g@b.com")))
            .await
            .unwrap();

        let wrong_password = login(&ctx.state, "a@b.com", "wrong-pass").await.unwrap_err();
        let unknown = login(&ctx.state, "nobody@b.com", "secret123").await.unwrap_err();
        let provider_only = login(&ctx.state, "g@b.com", "secret123").await.unwrap_err();

        assert_err(wrong_password, INVALID_CREDENTIALS);
        assert_err(unknown, INVALID_CREDENTIALS);
        assert_err(provider_only, INVALID_CREDENTIALS);
    }

    #[tokio::test]
    async fn login_rejects_deactivated_account() {
        let ctx = TestCtx::new();
        let issued = register(&ctx.state, register_req("a@b.com", "secret123"))
            .await
            .unwrap();
        ctx.users.set_active(issued.user.id, false);
        let err = login(&ctx.state, "a@b.com", "secret123").await.unwrap_err();
        assert_err(err, "Account is deactivated");
    }

    #[tokio::test]
    async fn provider_login_links_existing_account_then_resolves_by_id() {
        let ctx = TestCtx::new();
        let registered = register(&ctx.state, register_req("a@b.com", "secret123"))
            .await
            .unwrap()
            .user;

        let first = login_with_provider(&ctx.state, google_profile("g-1", Some("A@B.com")))
            .await
            .unwrap();
        assert_eq!(first.user.id, registered.id);
        assert_eq!(first.user.google_id.as_deref(), Some("g-1"));
        assert!(first.user.password_hash.is_some());
        assert_eq!(ctx.users.len(), 1);

        // email at the provider changed; the provider id still resolves
        let second = login_with_provider(&ctx.state, google_profile("g-1", Some("new@b.com")))
            .await
            .unwrap();
        assert_eq!(second.user.id, registered.id);
        assert_eq!(ctx.users.len(), 1);
        assert_ne!(first.access_token, second.access_token);
    }

    #[tokio::test]
    async fn provider_login_creates_passwordless_account() {
        let ctx = TestCtx::new();
        let issued = login_with_provider(&ctx.state, google_profile("g-2", Some("new@b.com")))
            .await
            .unwrap();
        assert_eq!(issued.user.email, "new@b.com");
        assert_eq!(issued.user.first_name, "Gee");
        assert!(issued.user.password_hash.is_none());
        assert_eq!(issued.user.avatar_url.as_deref(), Some("https://img.test/g.png"));
    }

    #[tokio::test]
    async fn provider_login_requires_email() {
        let ctx = TestCtx::new();
        let err = login_with_provider(&ctx.state, google_profile("g-3", None))
            .await
            .unwrap_err();
        assert_err(err, "No email provided by Google");
        assert_eq!(ctx.users.len(), 0);
    }

    #[tokio::test]
    async fn provider_login_leaves_deactivated_account_untouched() {
        let ctx = TestCtx::new();
        let registered = register(&ctx.state, register_req("a@b.com", "secret123"))
            .await
            .unwrap()
            .user;
        ctx.users.set_active(registered.id, false);

        let err = login_with_provider(&ctx.state, google_profile("g-9", Some("a@b.com")))
            .await
            .unwrap_err();
        assert_err(err, "Account is deactivated");

        let stored = ctx.users.find_by_email("a@b.com").await.unwrap().unwrap();
        assert_eq!(stored.google_id, None);
        assert_eq!(stored.avatar_url, None);
        assert_eq!(stored.updated_at, registered.updated_at);
        assert!(ctx.users.find_by_google_id("g-9").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn provider_login_rejects_non_ascii_email() {
        let ctx = TestCtx::new();
        let err = login_with_provider(&ctx.state, google_profile("g-4", Some("Ünï@b.com")))
            .await
            .unwrap_err();
        assert_err(err, "Invalid email provided by Google");
        assert_eq!(ctx.users.len(), 0);
    }

    #[tokio::test]
    async fn update_profile_blank_clears_optional_fields() {
        let ctx = TestCtx::new();
        let user = register(&ctx.state, register_req("a@b.com", "secret123"))
            .await
            .unwrap()
            .user;
        update_profile(
            &ctx.state,
            user.id,
            UpdateProfileRequest {
                first_name: None,
                last_name: Some("Smith".into()),
                avatar_url: Some("https://img.test/a.png".into()),
            },
        )
        .await
        .unwrap();

        // absent fields are kept
        let kept = update_profile(&ctx.state, user.id, UpdateProfileRequest::default())
            .await
            .unwrap();
        assert_eq!(kept.last_name.as_deref(), Some("Smith"));
        assert_eq!(kept.avatar_url.as_deref(), Some("https://img.test/a.png"));

        let cleared = update_profile(
            &ctx.state,
            user.id,
            UpdateProfileRequest {
                first_name: None,
                last_name: Some("".into()),
                avatar_url: Some("  ".into()),
            },
        )
        .await
        .unwrap();
        assert_eq!(cleared.first_name, "A");
        assert_eq!(cleared.last_name, None);
        assert_eq!(cleared.avatar_url, None);
    }

    #[tokio::test]
    async fn update_profile_changes_fields() {
        let ctx = TestCtx::new();
        let user = register(&ctx.state, register_req("a@b.com", "secret123"))
            .await
            .unwrap()
            .user;

        let updated = update_profile(
            &ctx.state,
            user.id,
            UpdateProfileRequest {
                first_name: Some("Alice".into()),
                last_name: Some("Smith".into()),
                avatar_url: None,
            },
        )
        .await
        .unwrap();
        assert_eq!(updated.first_name, "Alice");
        assert_eq!(updated.last_name.as_deref(), Some("Smith"));

        let err = update_profile(
            &ctx.state,
            user.id,
            UpdateProfileRequest {
                first_name: Some(" ".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn current_user_misses_are_not_found() {
        let ctx = TestCtx::new();
        let err = current_user(&ctx.state, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }
}

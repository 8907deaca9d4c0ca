//! Session cookie construction.
//!
//! The cookie carries only the opaque sid; everything else lives in the
//! store. Jar encryption comes from the `PrivateCookieJar` key in
//! [`CookieSettings`](crate::config::CookieSettings).

use axum_extra::extract::PrivateCookieJar;
use axum_extra::extract::cookie::{Cookie, SameSite};
use time::Duration;

use crate::config::CookieSettings;

/// Create the session cookie holding `sid`.
///
/// No `Max-Age`: a browser-session cookie. The server-side TTLs bound the
/// session's real lifetime.
pub(crate) fn session_cookie(settings: &CookieSettings, sid: &str) -> Cookie<'static> {
    Cookie::build((settings.name.clone(), sid.to_string()))
        .http_only(true)
        .secure(settings.secure)
        .same_site(SameSite::Strict)
        .path(settings.path.clone())
        .build()
}

/// Create the removal cookie for the session.
pub(crate) fn clear_session_cookie(settings: &CookieSettings) -> Cookie<'static> {
    Cookie::build((settings.name.clone(), ""))
        .path(settings.path.clone())
        .max_age(Duration::ZERO)
        .build()
}

/// Get the sid from the jar, if the session cookie is present.
pub(crate) fn get_sid(jar: &PrivateCookieJar, settings: &CookieSettings) -> Option<String> {
    jar.get(&settings.name).map(|c| c.value().to_string())
}

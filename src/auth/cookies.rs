use axum::http::{header, HeaderMap, HeaderValue};
use cookie::{time::Duration, Cookie, SameSite};

/// Cookie that carries the session token.
pub const AUTH_COOKIE_NAME: &str = "authToken";

/// Builds the `Set-Cookie` value for a freshly issued token.
pub fn session_cookie(token: &str, max_age: std::time::Duration, secure: bool) -> Cookie<'static> {
    Cookie::build((AUTH_COOKIE_NAME, token.to_string()))
        .http_only(true)
        .secure(secure)
        .same_site(SameSite::Lax)
        .path("/")
        .max_age(Duration::seconds(max_age.as_secs() as i64))
        .build()
}

/// Empty, immediately expiring cookie used on logout.
pub fn clear_session_cookie(secure: bool) -> Cookie<'static> {
    Cookie::build((AUTH_COOKIE_NAME, ""))
        .http_only(true)
        .secure(secure)
        .same_site(SameSite::Lax)
        .path("/")
        .max_age(Duration::ZERO)
        .build()
}

pub fn set_cookie_header(cookie: &Cookie<'_>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&cookie.to_string()) {
        headers.insert(header::SET_COOKIE, value);
    }
    headers
}

/// Pulls the session token out of the request's `Cookie` headers. Other
/// transports (Authorization header, query string) are not recognized.
pub fn extract_session_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(Cookie::split_parse)
        .filter_map(Result::ok)
        .find(|c| c.name() == AUTH_COOKIE_NAME)
        .map(|c| c.value().to_string())
        .filter(|v| !v.is_empty())
}

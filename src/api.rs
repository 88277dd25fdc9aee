// src/api.rs
use crate::auth::{self, SessionKeys};
use crate::db::{self, DbPool};
use crate::error::{recover, reject, AppError};
use crate::lookup::PriceLookup;
use crate::models::{
    CredentialsForm, FundsForm, Position, QuoteForm, SessionGrant, TradeForm,
};
use crate::settlement;
use crate::validate::{self, Order};
use log::info;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use warp::http::header::{HeaderMap, HeaderValue, CACHE_CONTROL, EXPIRES, PRAGMA, SET_COOKIE};
use warp::{Filter, Rejection, Reply};

pub const SESSION_COOKIE: &str = "session";
const MAX_FORM_BYTES: u64 = 16 * 1024;

/// Everything a request handler needs. Cloned into each filter chain.
#[derive(Clone)]
pub struct AppState {
    pub pool: DbPool,
    pub lookup: Arc<dyn PriceLookup>,
    pub sessions: Arc<SessionKeys>,
    pub password_rounds: u32,
}

pub fn routes(state: AppState) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
    let index = warp::path::end()
        .and(warp::get())
        .and(authenticated(state.clone()))
        .and(with_state(state.clone()))
        .and_then(index_handler);

    let buy_form = warp::path!("buy")
        .and(warp::get())
        .and(authenticated(state.clone()))
        .map(|_: i64| form_fields(&["symbol", "shares"]));

    let buy = warp::path!("buy")
        .and(warp::post())
        .and(authenticated(state.clone()))
        .and(with_state(state.clone()))
        .and(form_body())
        .and_then(buy_handler);

    let sell_form = warp::path!("sell")
        .and(warp::get())
        .and(authenticated(state.clone()))
        .and(with_state(state.clone()))
        .and_then(sell_form_handler);

    let sell = warp::path!("sell")
        .and(warp::post())
        .and(authenticated(state.clone()))
        .and(with_state(state.clone()))
        .and(form_body())
        .and_then(sell_handler);

    let quote_form = warp::path!("quote")
        .and(warp::get())
        .and(authenticated(state.clone()))
        .map(|_: i64| form_fields(&["symbol"]));

    let quote = warp::path!("quote")
        .and(warp::post())
        .and(authenticated(state.clone()))
        .and(with_state(state.clone()))
        .and(form_body())
        .and_then(quote_handler);

    let register_form = warp::path!("register")
        .and(warp::get())
        .map(|| form_fields(&["username", "password", "confirmation"]));

    let register = warp::path!("register")
        .and(warp::post())
        .and(with_state(state.clone()))
        .and(form_body())
        .and_then(register_handler);

    let login_form = warp::path!("login")
        .and(warp::get())
        .map(|| form_fields(&["username", "password"]));

    let login = warp::path!("login")
        .and(warp::post())
        .and(with_state(state.clone()))
        .and(form_body())
        .and_then(login_handler);

    let logout = warp::path!("logout").and(warp::get()).map(|| {
        warp::reply::with_header(
            warp::reply::json(&json!({ "message": "logged out" })),
            SET_COOKIE,
            format!("{}=; HttpOnly; SameSite=Lax; Path=/; Max-Age=0", SESSION_COOKIE),
        )
    });

    let history = warp::path!("history")
        .and(warp::get())
        .and(authenticated(state.clone()))
        .and(with_state(state.clone()))
        .and_then(history_handler);

    let funds_form = warp::path!("funds")
        .and(warp::get())
        .and(authenticated(state.clone()))
        .map(|_: i64| form_fields(&["funds"]));

    let funds = warp::path!("funds")
        .and(warp::post())
        .and(authenticated(state.clone()))
        .and(with_state(state))
        .and(form_body())
        .and_then(funds_handler);

    let mut no_cache = HeaderMap::new();
    no_cache.insert(
        CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    no_cache.insert(EXPIRES, HeaderValue::from_static("0"));
    no_cache.insert(PRAGMA, HeaderValue::from_static("no-cache"));

    index
        .or(buy_form)
        .or(buy)
        .or(sell_form)
        .or(sell)
        .or(quote_form)
        .or(quote)
        .or(register_form)
        .or(register)
        .or(login_form)
        .or(login)
        .or(logout)
        .or(history)
        .or(funds_form)
        .or(funds)
        .recover(recover)
        .with(warp::reply::with::headers(no_cache))
}

fn with_state(
    state: AppState,
) -> impl Filter<Extract = (AppState,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || state.clone())
}

/// Resolves the caller's user id from the session cookie, or from an
/// `Authorization: Bearer` header when no cookie is sent.
fn authenticated(state: AppState) -> impl Filter<Extract = (i64,), Error = Rejection> + Clone {
    warp::cookie::optional::<String>(SESSION_COOKIE)
        .and(warp::header::optional::<String>("authorization"))
        .and_then(move |cookie: Option<String>, header: Option<String>| {
            let sessions = state.sessions.clone();
            async move {
                let token = cookie.filter(|c| !c.is_empty()).or_else(|| {
                    header.and_then(|h| h.strip_prefix("Bearer ").map(str::to_string))
                });
                match token {
                    Some(token) => sessions.verify(&token).map_err(reject),
                    None => Err(reject(AppError::auth("login required"))),
                }
            }
        })
}

/// Accepts url-encoded forms and JSON bodies alike.
fn form_body<T: DeserializeOwned + Send>(
) -> impl Filter<Extract = (T,), Error = Rejection> + Clone {
    warp::body::content_length_limit(MAX_FORM_BYTES)
        .and(warp::body::json().or(warp::body::form()).unify())
}

fn form_fields(fields: &[&str]) -> warp::reply::Json {
    warp::reply::json(&json!({ "fields": fields }))
}

/// The token travels only in the `HttpOnly` cookie. Bearer clients read it
/// from `Set-Cookie`.
fn session_reply(sessions: &SessionKeys, user_id: i64) -> Result<impl Reply, Rejection> {
    let token = sessions.issue(user_id).map_err(reject)?;
    let cookie = format!(
        "{}={}; HttpOnly; SameSite=Lax; Path=/; Max-Age={}",
        SESSION_COOKIE,
        token,
        sessions.ttl().num_seconds()
    );
    Ok(warp::reply::with_header(
        warp::reply::json(&SessionGrant { user_id }),
        SET_COOKIE,
        cookie,
    ))
}

async fn index_handler(user_id: i64, state: AppState) -> Result<impl Reply, Rejection> {
    let view = settlement::portfolio(&state.pool, state.lookup.as_ref(), user_id)
        .await
        .map_err(reject)?;
    Ok(warp::reply::json(&view))
}

async fn buy_handler(
    user_id: i64,
    state: AppState,
    form: TradeForm,
) -> Result<impl Reply, Rejection> {
    let order = Order::parse(form.symbol.as_deref(), form.shares.as_deref()).map_err(reject)?;
    let receipt = settlement::buy(&state.pool, state.lookup.as_ref(), user_id, &order)
        .await
        .map_err(reject)?;
    Ok(warp::reply::json(&receipt))
}

async fn sell_form_handler(user_id: i64, state: AppState) -> Result<impl Reply, Rejection> {
    let positions: Vec<Position> = held_positions(&state.pool, user_id)
        .await
        .map_err(reject)?;
    Ok(warp::reply::json(&json!({ "fields": ["symbol", "shares"], "stocks": positions })))
}

async fn held_positions(pool: &DbPool, user_id: i64) -> Result<Vec<Position>, AppError> {
    Ok(db::holdings(pool, user_id)
        .await?
        .into_iter()
        .map(|h| Position {
            symbol: h.symbol,
            shares: h.shares,
        })
        .collect())
}

async fn sell_handler(
    user_id: i64,
    state: AppState,
    form: TradeForm,
) -> Result<impl Reply, Rejection> {
    let order = Order::parse(form.symbol.as_deref(), form.shares.as_deref()).map_err(reject)?;
    let receipt = settlement::sell(&state.pool, state.lookup.as_ref(), user_id, &order)
        .await
        .map_err(reject)?;
    Ok(warp::reply::json(&receipt))
}

async fn quote_handler(
    _user_id: i64,
    state: AppState,
    form: QuoteForm,
) -> Result<impl Reply, Rejection> {
    let symbol = validate::symbol(form.symbol.as_deref()).map_err(reject)?;
    let quote = settlement::quote(state.lookup.as_ref(), &symbol)
        .await
        .map_err(reject)?;
    Ok(warp::reply::json(&quote))
}

async fn register_handler(
    state: AppState,
    form: CredentialsForm,
) -> Result<impl Reply, Rejection> {
    let user_id = auth::register(
        &state.pool,
        form.username.as_deref(),
        form.password.as_deref(),
        form.confirmation.as_deref(),
        state.password_rounds,
    )
    .await
    .map_err(reject)?;
    session_reply(&state.sessions, user_id)
}

async fn login_handler(state: AppState, form: CredentialsForm) -> Result<impl Reply, Rejection> {
    let user_id = auth::login(&state.pool, form.username.as_deref(), form.password.as_deref())
        .await
        .map_err(reject)?;
    session_reply(&state.sessions, user_id)
}

async fn history_handler(user_id: i64, state: AppState) -> Result<impl Reply, Rejection> {
    match db::history(&state.pool, user_id).await {
        Ok(entries) => {
            info!("History retrieved for user {}.", user_id);
            Ok(warp::reply::json(&entries))
        }
        Err(e) => Err(reject(e.into())),
    }
}

async fn funds_handler(
    user_id: i64,
    state: AppState,
    form: FundsForm,
) -> Result<impl Reply, Rejection> {
    let amount = validate::deposit_amount(form.funds.as_deref()).map_err(reject)?;
    let balance = settlement::deposit(&state.pool, user_id, amount)
        .await
        .map_err(reject)?;
    Ok(warp::reply::json(&balance))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_pool;
    use crate::lookup::StaticLookup;
    use chrono::Duration;
    use rust_decimal_macros::dec;
    use serde_json::Value;
    use warp::http::StatusCode;
    use warp::hyper::body::Bytes;

    async fn test_state() -> AppState {
        let lookup = StaticLookup::new()
            .with("ABC", "ABC Corp", dec!(100))
            .with("XYZ", "XYZ Inc", dec!(12.5));
        AppState {
            pool: memory_pool().await,
            lookup: Arc::new(lookup),
            sessions: Arc::new(SessionKeys::new(b"test-secret", Duration::hours(1))),
            password_rounds: 1_000,
        }
    }

    fn body(bytes: &Bytes) -> Value {
        serde_json::from_slice(bytes).expect("json body")
    }

    /// Registers `alice` with a form post and returns the session token.
    async fn register_alice<F>(api: &F) -> String
    where
        F: Filter + 'static,
        F::Extract: Reply + Send,
    {
        let res = warp::test::request()
            .method("POST")
            .path("/register")
            .header("content-type", "application/x-www-form-urlencoded")
            .body("username=alice&password=pw&confirmation=pw")
            .reply(api)
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        let cookie = res.headers()["set-cookie"].to_str().unwrap();
        assert!(cookie.starts_with("session="));
        assert!(cookie.contains("HttpOnly"));
        token_from(cookie)
    }

    fn token_from(cookie: &str) -> String {
        cookie
            .split(';')
            .next()
            .and_then(|pair| pair.strip_prefix("session="))
            .unwrap()
            .to_string()
    }

    #[tokio::test]
    async fn mutating_routes_require_login() {
        let api = routes(test_state().await);

        for (method, path) in [
            ("GET", "/"),
            ("POST", "/buy"),
            ("POST", "/sell"),
            ("GET", "/history"),
            ("POST", "/funds"),
            ("POST", "/quote"),
        ] {
            let res = warp::test::request()
                .method(method)
                .path(path)
                .json(&json!({ "symbol": "ABC", "shares": 1, "funds": 5 }))
                .reply(&api)
                .await;
            assert_eq!(res.status(), StatusCode::FORBIDDEN, "{method} {path}");
            assert_eq!(
                body(res.body()),
                json!({ "code": 403, "message": "login required" })
            );
        }
    }

    #[tokio::test]
    async fn responses_are_never_cached() {
        let api = routes(test_state().await);
        for path in ["/login", "/nowhere"] {
            let res = warp::test::request().path(path).reply(&api).await;
            assert_eq!(
                res.headers()["cache-control"],
                "no-cache, no-store, must-revalidate"
            );
            assert_eq!(res.headers()["pragma"], "no-cache");
            assert_eq!(res.headers()["expires"], "0");
        }
        let res = warp::test::request().path("/nowhere").reply(&api).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        assert_eq!(body(res.body())["code"], 404);
    }

    #[tokio::test]
    async fn trading_flow_over_http() {
        let api = routes(test_state().await);
        let token = register_alice(&api).await;
        let auth = format!("Bearer {}", token);

        let res = warp::test::request()
            .method("POST")
            .path("/buy")
            .header("authorization", &auth)
            .json(&json!({ "symbol": "abc", "shares": "5" }))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        let receipt = body(res.body());
        assert_eq!(receipt["symbol"], "ABC");
        assert_eq!(receipt["shares"], 5);

        let res = warp::test::request()
            .path("/sell")
            .header("authorization", &auth)
            .reply(&api)
            .await;
        assert_eq!(
            body(res.body())["stocks"],
            json!([{ "symbol": "ABC", "shares": 5 }])
        );

        let res = warp::test::request()
            .method("POST")
            .path("/sell")
            .header("authorization", &auth)
            .header("content-type", "application/x-www-form-urlencoded")
            .body("symbol=ABC&shares=6")
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body(res.body())["message"], "insufficient shares to sell");

        let res = warp::test::request()
            .method("POST")
            .path("/sell")
            .header("authorization", &auth)
            .json(&json!({ "symbol": "ABC", "shares": 5 }))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::OK);

        let res = warp::test::request()
            .path("/history")
            .header("authorization", &auth)
            .reply(&api)
            .await;
        let rows = body(res.body());
        let deltas: Vec<i64> = rows
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["shares"].as_i64().unwrap())
            .collect();
        assert_eq!(deltas, vec![5, -5]);

        let res = warp::test::request()
            .path("/")
            .header("authorization", &auth)
            .reply(&api)
            .await;
        let view = body(res.body());
        assert_eq!(view["cash_usd"], "$10,000.00");
        assert_eq!(view["holdings"], json!([]));
    }

    #[tokio::test]
    async fn session_cookie_authenticates() {
        let api = routes(test_state().await);
        let token = register_alice(&api).await;

        let res = warp::test::request()
            .method("POST")
            .path("/funds")
            .header("cookie", format!("{}={}", SESSION_COOKIE, token))
            .header("content-type", "application/x-www-form-urlencoded")
            .body("funds=200")
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(body(res.body())["cash_usd"], "$10,200.00");
    }

    #[tokio::test]
    async fn invalid_input_is_a_bad_request() {
        let api = routes(test_state().await);
        let auth = format!("Bearer {}", register_alice(&api).await);

        let cases = [
            ("/buy", json!({ "symbol": "ABC", "shares": "1.5" }), "shares must be a positive whole number"),
            ("/buy", json!({ "shares": 1 }), "must enter stock symbol"),
            ("/buy", json!({ "symbol": "A;B", "shares": 1 }), "stock symbol cannot contain special characters"),
            ("/buy", json!({ "symbol": "NOPE", "shares": 1 }), "invalid symbol"),
            ("/buy", json!({ "symbol": "ABC", "shares": 1000 }), "insufficient funds for purchase"),
            ("/funds", json!({ "funds": "-5" }), "must enter a value greater than 0"),
            ("/quote", json!({ "symbol": "NOPE" }), "invalid symbol"),
        ];
        for (path, payload, message) in cases {
            let res = warp::test::request()
                .method("POST")
                .path(path)
                .header("authorization", &auth)
                .json(&payload)
                .reply(&api)
                .await;
            assert_eq!(res.status(), StatusCode::BAD_REQUEST, "{path} {payload}");
            assert_eq!(body(res.body())["message"], message, "{path} {payload}");
        }
    }

    #[tokio::test]
    async fn quote_returns_price() {
        let api = routes(test_state().await);
        let auth = format!("Bearer {}", register_alice(&api).await);

        let res = warp::test::request()
            .method("POST")
            .path("/quote")
            .header("authorization", &auth)
            .json(&json!({ "symbol": "xyz" }))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(
            body(res.body()),
            json!({ "symbol": "XYZ", "name": "XYZ Inc", "price": "12.5" })
        );
    }

    #[tokio::test]
    async fn login_and_logout() {
        let api = routes(test_state().await);
        register_alice(&api).await;

        let res = warp::test::request()
            .method("POST")
            .path("/login")
            .json(&json!({ "username": "alice", "password": "wrong" }))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            body(res.body())["message"],
            "invalid username and/or password"
        );

        let res = warp::test::request()
            .method("POST")
            .path("/login")
            .json(&json!({ "username": "alice", "password": "pw" }))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        assert!(res.headers().contains_key("set-cookie"));

        let res = warp::test::request().path("/logout").reply(&api).await;
        let cookie = res.headers()["set-cookie"].to_str().unwrap();
        assert!(cookie.starts_with("session=;"));
        assert!(cookie.contains("Max-Age=0"));
    }

    #[tokio::test]
    async fn session_token_is_not_in_the_body() {
        let api = routes(test_state().await);
        register_alice(&api).await;

        let res = warp::test::request()
            .method("POST")
            .path("/login")
            .header("content-type", "application/x-www-form-urlencoded")
            .body("username=alice&password=pw")
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        let grant = body(res.body());
        assert!(grant.get("token").is_none());
        assert!(grant["user_id"].is_i64());

        let token = token_from(res.headers()["set-cookie"].to_str().unwrap());
        assert!(!res.body().windows(token.len()).any(|w| w == token.as_bytes()));
        let res = warp::test::request()
            .path("/history")
            .header("authorization", format!("Bearer {}", token))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let api = routes(test_state().await);
        register_alice(&api).await;

        let res = warp::test::request()
            .method("POST")
            .path("/register")
            .json(&json!({ "username": "alice", "password": "x", "confirmation": "x" }))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body(res.body())["message"], "username already in use");
    }
}

// Session and identity endpoint types

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Locally persisted credentials
///
/// Only the two tokens are ever rewritten by a refresh. Everything else,
/// including fields this crate does not know about, is carried through
/// unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub access_token: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    #[serde(default)]
    pub user: Value,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Session {
    pub fn new(access_token: String, refresh_token: Option<String>, user: Value) -> Self {
        Self {
            access_token,
            refresh_token,
            user,
            extra: Map::new(),
        }
    }

    /// Refresh token, if one is stored and non-empty
    pub fn usable_refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_deref().filter(|t| !t.is_empty())
    }

    /// Build the session that replaces this one after a successful refresh
    ///
    /// A server that does not rotate refresh tokens omits `refreshToken`;
    /// the previous one stays valid in that case.
    pub fn with_refreshed_tokens(&self, data: TokenData) -> Self {
        Self {
            access_token: data.access_token,
            refresh_token: data.refresh_token.or_else(|| self.refresh_token.clone()),
            user: self.user.clone(),
            extra: self.extra.clone(),
        }
    }
}

/// Token pair returned by the identity endpoints
#[derive(Debug, Clone, PartialEq)]
pub struct TokenData {
    pub access_token: String,
    pub refresh_token: Option<String>,
}

/// Refresh request body
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest<'a> {
    pub refresh_token: &'a str,
    pub unique_id: &'a str,
}

/// Refresh response body
///
/// Some deployments answer with `token` instead of `accessToken`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponse {
    pub access_token: Option<String>,
    pub token: Option<String>,
    pub refresh_token: Option<String>,
}

impl RefreshResponse {
    /// Extract the token pair, rejecting bodies without an access token
    pub fn into_token_data(self) -> Option<TokenData> {
        let access_token = self
            .access_token
            .filter(|t| !t.is_empty())
            .or(self.token.filter(|t| !t.is_empty()))?;

        Some(TokenData {
            access_token,
            refresh_token: self.refresh_token.filter(|t| !t.is_empty()),
        })
    }
}

/// Login request body
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest<'a> {
    pub email: &'a str,
    pub password: &'a str,
    pub unique_id: &'a str,
}

/// Login response body
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    #[serde(flatten)]
    pub tokens: RefreshResponse,

    #[serde(default)]
    pub user: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_session_roundtrip_keeps_unknown_fields() {
        let raw = json!({
            "accessToken": "T0",
            "refreshToken": "R0",
            "user": {"id": 7, "name": "Ada"},
            "deviceLocale": "en"
        });

        let session: Session = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(session.access_token, "T0");
        assert_eq!(session.usable_refresh_token(), Some("R0"));
        assert_eq!(session.extra.get("deviceLocale"), Some(&json!("en")));

        assert_eq!(serde_json::to_value(&session).unwrap(), raw);
    }

    #[test]
    fn test_session_without_refresh_token() {
        let session: Session =
            serde_json::from_value(json!({"accessToken": "T0", "user": null})).unwrap();
        assert!(session.usable_refresh_token().is_none());

        let empty = Session::new("T0".to_string(), Some(String::new()), Value::Null);
        assert!(empty.usable_refresh_token().is_none());
    }

    #[test]
    fn test_refresh_keeps_old_refresh_token_when_omitted() {
        let session = Session::new("T0".to_string(), Some("R0".to_string()), json!({"id": 1}));
        let updated = session.with_refreshed_tokens(TokenData {
            access_token: "T1".to_string(),
            refresh_token: None,
        });

        assert_eq!(updated.access_token, "T1");
        assert_eq!(updated.refresh_token.as_deref(), Some("R0"));
        assert_eq!(updated.user, json!({"id": 1}));
    }

    #[test]
    fn test_refresh_response_token_alias() {
        let body: RefreshResponse = serde_json::from_str(r#"{"token":"T1"}"#).unwrap();
        let data = body.into_token_data().unwrap();
        assert_eq!(data.access_token, "T1");
        assert!(data.refresh_token.is_none());

        let body: RefreshResponse =
            serde_json::from_str(r#"{"accessToken":"T2","refreshToken":"R2"}"#).unwrap();
        let data = body.into_token_data().unwrap();
        assert_eq!(data.access_token, "T2");
        assert_eq!(data.refresh_token.as_deref(), Some("R2"));
    }

    #[test]
    fn test_refresh_response_without_access_token() {
        let body: RefreshResponse = serde_json::from_str(r#"{"refreshToken":"R2"}"#).unwrap();
        assert!(body.into_token_data().is_none());

        let body: RefreshResponse = serde_json::from_str(r#"{"accessToken":""}"#).unwrap();
        assert!(body.into_token_data().is_none());
    }

    #[test]
    fn test_login_response_parsing() {
        let body: LoginResponse = serde_json::from_str(
            r#"{"accessToken":"T0","refreshToken":"R0","user":{"email":"a@b.c"}}"#,
        )
        .unwrap();
        assert_eq!(body.user["email"], "a@b.c");
        assert_eq!(body.tokens.into_token_data().unwrap().access_token, "T0");
    }

    proptest! {
        #[test]
        fn refresh_only_replaces_tokens(
            old_access in "[A-Za-z0-9]{1,16}",
            old_refresh in proptest::option::of("[A-Za-z0-9]{1,16}"),
            new_access in "[A-Za-z0-9]{1,16}",
            new_refresh in proptest::option::of("[A-Za-z0-9]{1,16}"),
            user_id in any::<u32>(),
            extra_value in "[a-z]{0,8}",
        ) {
            let mut session = Session::new(old_access, old_refresh.clone(), json!({"id": user_id}));
            session.extra.insert("locale".to_string(), json!(extra_value));

            let updated = session.with_refreshed_tokens(TokenData {
                access_token: new_access.clone(),
                refresh_token: new_refresh.clone(),
            });

            prop_assert_eq!(updated.access_token, new_access);
            prop_assert_eq!(updated.refresh_token, new_refresh.or(old_refresh));
            prop_assert_eq!(updated.user, session.user);
            prop_assert_eq!(updated.extra, session.extra);
        }
    }
}

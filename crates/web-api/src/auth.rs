//! JWT 校验
//!
//! 令牌由外部认证服务签发，这里只校验签名与过期时间并取出身份。

use axum::http::HeaderMap;
use domain::{UserId, Username};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ApiError;

/// JWT Claims 结构
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub username: String,
    pub exp: i64, // 过期时间 (Unix timestamp)
}

/// 已认证的连接身份
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub username: Username,
}

impl TryFrom<Claims> for Identity {
    type Error = ApiError;

    fn try_from(claims: Claims) -> Result<Self, Self::Error> {
        let username = Username::parse(claims.username)
            .map_err(|err| ApiError::unauthorized(format!("Invalid username claim: {err}")))?;
        Ok(Self {
            user_id: UserId::from(claims.sub),
            username,
        })
    }
}

/// JWT Token 服务
#[derive(Clone)]
pub struct JwtService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl JwtService {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    /// 签发 token，供测试与本地调试使用
    pub fn generate_token(
        &self,
        user_id: Uuid,
        username: &str,
        ttl: chrono::Duration,
    ) -> Result<String, ApiError> {
        let claims = Claims {
            sub: user_id,
            username: username.to_string(),
            exp: (chrono::Utc::now() + ttl).timestamp(),
        };

        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|err| ApiError::unauthorized(format!("Token generation failed: {err}")))
    }

    /// 验证并解析 JWT token
    pub fn verify_token(&self, token: &str) -> Result<Claims, ApiError> {
        decode::<Claims>(token, &self.decoding_key, &Validation::default())
            .map(|token_data| token_data.claims)
            .map_err(|err| ApiError::unauthorized(format!("Invalid token: {err}")))
    }

    /// 从 headers 中提取和验证 token
    pub fn identity_from_headers(&self, headers: &HeaderMap) -> Result<Identity, ApiError> {
        let auth_header = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|header| header.to_str().ok())
            .ok_or_else(|| ApiError::unauthorized("Missing authorization header"))?;

        let token = auth_header
            .strip_prefix("Bearer ")
            .ok_or_else(|| ApiError::unauthorized("Invalid authorization header format"))?;

        Identity::try_from(self.verify_token(token)?)
    }
}

/// WebSocket 握手的身份参数
#[derive(Debug, Default, Deserialize)]
pub struct WsAuthQuery {
    pub token: Option<String>,
    pub user_id: Option<Uuid>,
    pub username: Option<String>,
}

/// 有密钥时只接受 token；开发模式下接受 user_id + username
pub fn authenticate(jwt: Option<&JwtService>, query: &WsAuthQuery) -> Result<Identity, ApiError> {
    if let Some(jwt) = jwt {
        let token = query
            .token
            .as_deref()
            .filter(|token| !token.is_empty())
            .ok_or_else(|| ApiError::unauthorized("Missing token"))?;
        return Identity::try_from(jwt.verify_token(token)?);
    }

    match (query.user_id, query.username.as_deref()) {
        (Some(user_id), Some(username)) => Ok(Identity {
            user_id: UserId::from(user_id),
            username: Username::parse(username)
                .map_err(|err| ApiError::bad_request(err.to_string()))?,
        }),
        _ => Err(ApiError::unauthorized("user_id and username are required")),
    }
}

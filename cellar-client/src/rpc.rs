//! The client RPC shim (§6, component F): one async call per server
//! operation, each a single JSON round-trip over the `/api/<op>` surface
//! `cellar-server` exposes. Mirrors the teacher's `reqwest`-based HTTP
//! usage, generalized from a REPL session to typed request/response pairs.

use cellar_core::error::{CResult, Error};
use cellar_core::model::{ByteBuf, SecretInfo, SecretValue, Version};
use serde_derive::{Deserialize, Serialize};

/// The CSRF/browser-lockout header every request must carry. Value is
/// arbitrary; its presence, under the transport-forbidden `Sec-*` prefix,
/// is what a browser can never forge.
pub const NO_BROWSERS_HEADER: &str = "sec-cellar-no-browsers";
pub const NO_BROWSERS_VALUE: &str = "1";

/// A thin `reqwest`-backed client bound to one server's base URL. Every
/// method is a single JSON POST round-trip; none of them cache or retry --
/// that is [`crate::store::CachedStore`]'s job, layered on top of this
/// shim.
#[derive(Clone)]
pub struct RpcClient {
    http: reqwest::Client,
    base_url: String,
}

impl RpcClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        RpcClient {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    pub fn with_http_client(base_url: impl Into<String>, http: reqwest::Client) -> Self {
        RpcClient {
            http,
            base_url: base_url.into(),
        }
    }

    async fn call<Req: Serialize, Resp: for<'de> Deserialize<'de>>(
        &self,
        op: &str,
        req: &Req,
    ) -> CResult<Resp> {
        let url = format!("{}/api/{op}", self.base_url.trim_end_matches('/'));
        let resp = self
            .http
            .post(url)
            .header(NO_BROWSERS_HEADER, NO_BROWSERS_VALUE)
            .json(req)
            .send()
            .await
            .map_err(|err| Error::internal(format!("request to {op} failed: {err}")))?;

        map_status_to_body(op, resp).await
    }

    pub async fn list(&self) -> CResult<Vec<SecretInfo>> {
        self.call("list", &serde_json::json!({})).await
    }

    pub async fn info(&self, name: &str) -> CResult<SecretInfo> {
        self.call("info", &NameRequest { name }).await
    }

    /// Unconditional active-value fetch: `version = 0`.
    pub async fn get(&self, name: &str) -> CResult<SecretValue> {
        self.get_raw(name, 0, false).await
    }

    pub async fn get_version(&self, name: &str, version: Version) -> CResult<SecretValue> {
        self.get_raw(name, version, false).await
    }

    /// Conditional get: returns the active value only if its version
    /// differs from `version`; surfaces [`Error::ValueNotChanged`]
    /// otherwise (a 304 on the wire).
    pub async fn get_if_changed(&self, name: &str, version: Version) -> CResult<SecretValue> {
        self.get_raw(name, version, true).await
    }

    async fn get_raw(&self, name: &str, version: Version, update_if_changed: bool) -> CResult<SecretValue> {
        let resp: GetResponse = self
            .call(
                "get",
                &GetRequest {
                    name,
                    version,
                    update_if_changed,
                },
            )
            .await?;
        Ok(SecretValue {
            value: resp.value.0,
            version: resp.version,
        })
    }

    pub async fn put(&self, name: &str, value: Vec<u8>) -> CResult<Version> {
        self.call(
            "put",
            &PutRequest {
                name,
                value: ByteBuf(value),
            },
        )
        .await
    }

    pub async fn activate(&self, name: &str, version: Version) -> CResult<()> {
        let _: serde_json::Value = self
            .call("activate", &VersionRequest { name, version })
            .await?;
        Ok(())
    }

    pub async fn delete(&self, name: &str) -> CResult<()> {
        let _: serde_json::Value = self.call("delete", &NameRequest { name }).await?;
        Ok(())
    }

    pub async fn delete_version(&self, name: &str, version: Version) -> CResult<()> {
        let _: serde_json::Value = self
            .call("delete-version", &VersionRequest { name, version })
            .await?;
        Ok(())
    }
}

async fn map_status_to_body<Resp: for<'de> Deserialize<'de>>(
    op: &str,
    resp: reqwest::Response,
) -> CResult<Resp> {
    let status = resp.status();
    if status == reqwest::StatusCode::NOT_MODIFIED {
        return Err(Error::ValueNotChanged);
    }

    if status == reqwest::StatusCode::FORBIDDEN {
        let body = resp.text().await.unwrap_or_default();
        return Err(Error::AccessDenied(body));
    }
    if status == reqwest::StatusCode::NOT_FOUND {
        let body = resp.text().await.unwrap_or_default();
        return Err(Error::NotFound(body));
    }
    if status == reqwest::StatusCode::BAD_REQUEST {
        let body = resp.text().await.unwrap_or_default();
        return Err(Error::BadRequest(body));
    }
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(Error::internal(format!("{op} failed with {status}: {body}")));
    }

    resp.json::<Resp>()
        .await
        .map_err(|err| Error::internal(format!("decoding {op} response: {err}")))
}

#[derive(Serialize)]
struct NameRequest<'a> {
    #[serde(rename = "Name")]
    name: &'a str,
}

#[derive(Serialize)]
struct VersionRequest<'a> {
    #[serde(rename = "Name")]
    name: &'a str,
    #[serde(rename = "Version")]
    version: Version,
}

#[derive(Serialize)]
struct GetRequest<'a> {
    #[serde(rename = "Name")]
    name: &'a str,
    #[serde(rename = "Version")]
    version: Version,
    #[serde(rename = "UpdateIfChanged")]
    update_if_changed: bool,
}

#[derive(Deserialize)]
struct GetResponse {
    #[serde(rename = "Value")]
    value: ByteBuf,
    #[serde(rename = "Version")]
    version: Version,
}

#[derive(Serialize)]
struct PutRequest<'a> {
    #[serde(rename = "Name")]
    name: &'a str,
    #[serde(rename = "Value")]
    value: ByteBuf,
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/put"))
            .and(header(NO_BROWSERS_HEADER, NO_BROWSERS_VALUE))
            .respond_with(ResponseTemplate::new(200).set_body_json(1u64))
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/api/get"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "Value": "VjE=",
                "Version": 1,
            })))
            .mount(&server)
            .await;

        let client = RpcClient::new(server.uri());
        assert_eq!(client.put("a", b"V1".to_vec()).await.unwrap(), 1);
        let value = client.get("a").await.unwrap();
        assert_eq!(value.value, b"V1");
        assert_eq!(value.version, 1);
    }

    #[tokio::test]
    async fn not_modified_maps_to_value_not_changed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/get"))
            .respond_with(ResponseTemplate::new(304).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let client = RpcClient::new(server.uri());
        let err = client.get_if_changed("a", 1).await.unwrap_err();
        assert!(matches!(err, Error::ValueNotChanged));
    }

    #[tokio::test]
    async fn not_found_and_access_denied_map_correctly() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/get"))
            .respond_with(ResponseTemplate::new(404).set_body_string("missing"))
            .mount(&server)
            .await;

        let client = RpcClient::new(server.uri());
        assert!(matches!(client.get("a").await, Err(Error::NotFound(_))));
    }
}

use super::{
    ApiError, ApiResult, ConnectionHandle, Credentials, ManagementApi, ObjectKind, QueryResponse,
    SchemaObject,
};
use crate::config::ApiConfig;
use crate::logging;
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;

const SCHEMA_OBJECTS_SQL: &str = "SELECT TABLE_SCHEMA, TABLE_NAME, TABLE_TYPE \
     FROM information_schema.TABLES ORDER BY TABLE_SCHEMA, TABLE_NAME";

/// `ManagementApi` over the proxy's REST interface.
pub struct HttpApi {
    client: Client,
    base_url: String,
    user: String,
    password: String,
    poll_interval: Duration,
    /// Applied to control calls only. Statements and ETL steps may run for
    /// as long as the server needs.
    request_timeout: Duration,
}

impl HttpApi {
    pub fn new(config: &ApiConfig) -> ApiResult<Self> {
        let request_timeout = Duration::from_secs(config.timeout_secs);
        let client = Client::builder()
            .connect_timeout(request_timeout)
            .build()
            .map_err(|e| ApiError::Unreachable(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            user: config.user.clone(),
            password: config.password.clone(),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            request_timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, self.url(path))
            .basic_auth(&self.user, Some(&self.password))
    }

    fn conn_request(&self, method: Method, conn: &ConnectionHandle, suffix: &str) -> RequestBuilder {
        self.request(method, &format!("sql/{}{}", conn.id, suffix))
            .query(&[("token", conn.token.as_str())])
    }

    /// Bounds a control call by the configured request timeout.
    fn control(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.timeout(self.request_timeout)
    }

    async fn send(&self, builder: RequestBuilder) -> ApiResult<Response> {
        builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ApiError::TimedOut(e.to_string())
            } else {
                ApiError::Unreachable(e.to_string())
            }
        })
    }

    async fn error_detail(resp: Response) -> String {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        serde_json::from_str::<Value>(&text)
            .ok()
            .and_then(|body| {
                body["errors"]
                    .as_array()
                    .map(|errors| {
                        errors
                            .iter()
                            .filter_map(|e| e["detail"].as_str())
                            .collect::<Vec<_>>()
                            .join("; ")
                    })
            })
            .filter(|detail| !detail.is_empty())
            .unwrap_or_else(|| {
                if text.is_empty() {
                    status.to_string()
                } else {
                    text
                }
            })
    }

    /// Turns non-success statuses into `ApiError`. On connection endpoints a
    /// 404 means the proxy has dropped the connection.
    async fn check(resp: Response, on_connection: bool) -> ApiResult<Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let message = Self::error_detail(resp).await;
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ApiError::Unauthorized(message)),
            StatusCode::NOT_FOUND if on_connection => Err(ApiError::ConnectionGone),
            _ => Err(ApiError::Rejected {
                status: status.as_u16(),
                code: None,
                message,
            }),
        }
    }

    async fn body(resp: Response) -> ApiResult<Value> {
        resp.json::<Value>()
            .await
            .map_err(|e| ApiError::Malformed(e.to_string()))
    }

    /// Follows `202 Accepted` + `Location` until the proxy reports the
    /// asynchronous request as finished.
    async fn resolve(&self, mut resp: Response) -> ApiResult<Value> {
        while resp.status() == StatusCode::ACCEPTED {
            let location = resp
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
                .ok_or_else(|| ApiError::Malformed("202 response without Location".into()))?;
            tokio::time::sleep(self.poll_interval).await;
            let next = self
                .send(self.control(self.request(Method::GET, &location)))
                .await?;
            resp = Self::check(next, true).await?;
        }
        Self::body(resp).await
    }

    async fn etl_step(
        &self,
        step: &str,
        source: &ConnectionHandle,
        destination: &ConnectionHandle,
        object: &SchemaObject,
    ) -> ApiResult<()> {
        let builder = self
            .conn_request(Method::POST, source, &format!("/etl/{}", step))
            .query(&[("target_token", destination.token.as_str())])
            .json(&json!({
                "type": "mariadb",
                "target": destination.id,
                "tables": [{ "schema": object.schema, "table": object.name }],
            }));
        let resp = Self::check(self.send(builder).await?, true).await?;
        let body = self.resolve(resp).await?;
        let results = &body["data"]["attributes"]["results"];

        if results["ok"].as_bool().unwrap_or(false) {
            return Ok(());
        }
        let message = results["tables"]
            .as_array()
            .and_then(|tables| tables.iter().find_map(|t| t["error"].as_str()))
            .or_else(|| results["error"].as_str())
            .unwrap_or("ETL step failed")
            .to_string();
        Err(ApiError::Rejected {
            status: 200,
            code: None,
            message,
        })
    }
}

#[async_trait]
impl ManagementApi for HttpApi {
    async fn open_connection(
        &self,
        target: &str,
        credentials: &Credentials,
    ) -> ApiResult<ConnectionHandle> {
        logging::debug(&format!("Opening SQL connection to {}", target));
        let mut payload = json!({
            "target": target,
            "user": credentials.user,
            "password": credentials.password,
        });
        if let Some(db) = &credentials.db {
            payload["db"] = json!(db);
        }
        if let Some(timeout) = credentials.timeout {
            payload["timeout"] = json!(timeout);
        }

        let resp = self
            .send(self.control(self.request(Method::POST, "sql").json(&payload)))
            .await?;
        let body = Self::body(Self::check(resp, false).await?).await?;
        let id = body["data"]["id"].as_str();
        let token = body["meta"]["token"].as_str();
        match (id, token) {
            (Some(id), Some(token)) => Ok(ConnectionHandle {
                id: id.to_string(),
                token: token.to_string(),
            }),
            _ => Err(ApiError::Malformed(
                "connection response without id or token".into(),
            )),
        }
    }

    async fn ping(&self, conn: &ConnectionHandle) -> ApiResult<bool> {
        let resp = self
            .send(self.control(self.conn_request(Method::GET, conn, "")))
            .await?;
        match Self::check(resp, true).await {
            Ok(_) => Ok(true),
            Err(ApiError::ConnectionGone) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn close_connection(&self, conn: &ConnectionHandle) -> ApiResult<()> {
        let resp = self
            .send(self.control(self.conn_request(Method::DELETE, conn, "")))
            .await?;
        match Self::check(resp, true).await {
            Ok(_) | Err(ApiError::ConnectionGone) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn execute(
        &self,
        conn: &ConnectionHandle,
        sql: &str,
        max_rows: u64,
    ) -> ApiResult<QueryResponse> {
        let builder = self
            .conn_request(Method::POST, conn, "/queries")
            .json(&json!({ "sql": sql, "max_rows": max_rows }));
        let resp = Self::check(self.send(builder).await?, true).await?;
        let body = self.resolve(resp).await?;
        serde_json::from_value(body["data"]["attributes"].clone())
            .map_err(|e| ApiError::Malformed(e.to_string()))
    }

    async fn cancel(&self, conn: &ConnectionHandle) -> ApiResult<()> {
        let resp = self
            .send(self.control(self.conn_request(Method::POST, conn, "/cancel")))
            .await?;
        Self::check(resp, true).await.map(|_| ())
    }

    async fn list_schema_objects(&self, conn: &ConnectionHandle) -> ApiResult<Vec<SchemaObject>> {
        let response = self.execute(conn, SCHEMA_OBJECTS_SQL, 0).await?;
        let statement = response
            .results
            .and_then(|results| results.into_iter().next())
            .ok_or_else(|| ApiError::Malformed("introspection returned no result".into()))?;
        if let Some(message) = statement.message.filter(|_| statement.errno.is_some()) {
            return Err(ApiError::Rejected {
                status: 200,
                code: statement.errno.map(|e| e.to_string()),
                message,
            });
        }

        let rows = statement.data.unwrap_or_default();
        Ok(rows
            .iter()
            .filter_map(|row| {
                let schema = row.first()?.as_str()?;
                let name = row.get(1)?.as_str()?;
                let kind = match row.get(2).and_then(Value::as_str) {
                    Some("VIEW") | Some("SYSTEM VIEW") => ObjectKind::View,
                    _ => ObjectKind::Table,
                };
                Some(SchemaObject {
                    schema: schema.to_string(),
                    name: name.to_string(),
                    kind,
                })
            })
            .collect())
    }

    async fn etl_create(
        &self,
        source: &ConnectionHandle,
        destination: &ConnectionHandle,
        object: &SchemaObject,
    ) -> ApiResult<()> {
        self.etl_step("prepare", source, destination, object).await
    }

    async fn etl_migrate(
        &self,
        source: &ConnectionHandle,
        destination: &ConnectionHandle,
        object: &SchemaObject,
    ) -> ApiResult<()> {
        self.etl_step("start", source, destination, object).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api() -> HttpApi {
        HttpApi::new(&ApiConfig {
            base_url: "http://127.0.0.1:8989/v1/".to_string(),
            ..ApiConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_url_joining() {
        let api = api();
        assert_eq!(api.url("sql"), "http://127.0.0.1:8989/v1/sql");
        assert_eq!(api.url("/sql/1/queries"), "http://127.0.0.1:8989/v1/sql/1/queries");
        assert_eq!(
            api.url("http://other:8989/v1/sql/1/queries/2"),
            "http://other:8989/v1/sql/1/queries/2"
        );
    }

    #[tokio::test]
    async fn test_unreachable_proxy_is_a_typed_error() {
        let api = HttpApi::new(&ApiConfig {
            base_url: "http://127.0.0.1:1/v1".to_string(),
            timeout_secs: 1,
            ..ApiConfig::default()
        })
        .unwrap();
        let err = api
            .open_connection("server1", &Credentials::new("maxskysql", "skysql"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Unreachable(_)));
        assert!(err.is_connection_lost());
    }

    /// Accepts connections and never answers them.
    async fn silent_proxy() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
        format!("http://{}/v1", addr)
    }

    #[tokio::test]
    async fn test_slow_control_call_times_out_without_losing_connection() {
        let api = HttpApi::new(&ApiConfig {
            base_url: silent_proxy().await,
            timeout_secs: 1,
            ..ApiConfig::default()
        })
        .unwrap();
        let conn = ConnectionHandle {
            id: "1".into(),
            token: "t".into(),
        };

        let err = api.ping(&conn).await.unwrap_err();
        assert!(matches!(err, ApiError::TimedOut(_)));
        assert!(!err.is_connection_lost());
    }

    #[tokio::test]
    async fn test_statements_are_not_bounded_by_request_timeout() {
        let api = HttpApi::new(&ApiConfig {
            base_url: silent_proxy().await,
            timeout_secs: 1,
            ..ApiConfig::default()
        })
        .unwrap();
        let conn = ConnectionHandle {
            id: "1".into(),
            token: "t".into(),
        };

        let pending =
            tokio::time::timeout(Duration::from_secs(2), api.execute(&conn, "SELECT SLEEP(10)", 10))
                .await;
        assert!(pending.is_err(), "statement ended early: {:?}", pending);
    }
}

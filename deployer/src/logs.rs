//! Log aggregator collaborator. Deployment logs never touch the core's own
//! stores; they are pulled from Loki with label filters and re-served over
//! SSE.

use std::collections::HashMap;

use runway_common::log::{extract_level, Item};
use serde::Deserialize;

use crate::error::Result;

const QUERY_TIMEOUT_SECS: u64 = 10;

#[derive(Clone, Debug, Default)]
pub struct LogQuery {
    pub project_id: String,
    pub deployment_id: Option<String>,
    pub environment_id: Option<String>,
    pub branch: Option<String>,
    pub keyword: Option<String>,
    /// Nanosecond epoch, inclusive.
    pub start_timestamp: Option<i64>,
    pub end_timestamp: Option<i64>,
    pub limit: usize,
}

impl LogQuery {
    pub fn deployment(project_id: &str, deployment_id: &str) -> Self {
        Self {
            project_id: project_id.to_string(),
            deployment_id: Some(deployment_id.to_string()),
            limit: 100,
            ..Default::default()
        }
    }

    /// The LogQL selector for this query's label filters.
    fn selector(&self) -> String {
        let mut parts = vec![format!("project_id=\"{}\"", self.project_id)];
        if let Some(deployment_id) = &self.deployment_id {
            parts.push(format!("deployment_id=\"{deployment_id}\""));
        }
        if let Some(environment_id) = &self.environment_id {
            parts.push(format!("environment_id=\"{environment_id}\""));
        }
        if let Some(branch) = &self.branch {
            parts.push(format!("branch=\"{branch}\""));
        }

        let mut query = format!("{{{}}}", parts.join(", "));
        if let Some(keyword) = &self.keyword {
            query.push_str(&format!(" |~ \"(?i){}\"", regex::escape(keyword)));
        }

        query
    }
}

#[derive(Debug, Deserialize)]
struct QueryRangeResponse {
    data: QueryRangeData,
}

#[derive(Debug, Deserialize)]
struct QueryRangeData {
    #[serde(default)]
    result: Vec<LokiStream>,
}

#[derive(Debug, Deserialize)]
struct LokiStream {
    #[serde(default)]
    stream: HashMap<String, String>,
    #[serde(default)]
    values: Vec<(String, String)>,
}

#[derive(Clone)]
pub struct LokiClient {
    http: reqwest::Client,
    base_url: String,
}

impl LokiClient {
    pub fn new(base_url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Fetch matching log lines, oldest first.
    pub async fn get_logs(&self, query: &LogQuery) -> Result<Vec<Item>> {
        let mut params = vec![
            ("query".to_string(), query.selector()),
            ("limit".to_string(), query.limit.to_string()),
        ];
        if let Some(start) = query.start_timestamp {
            params.push(("start".to_string(), start.to_string()));
        }
        if let Some(end) = query.end_timestamp {
            params.push(("end".to_string(), end.to_string()));
        }

        let response = self
            .http
            .get(format!("{}/loki/api/v1/query_range", self.base_url))
            .query(&params)
            .timeout(std::time::Duration::from_secs(QUERY_TIMEOUT_SECS))
            .send()
            .await?
            .error_for_status()?;

        let payload: QueryRangeResponse = response.json().await?;

        let mut items = Vec::new();
        for stream in payload.data.result {
            for (timestamp, message) in stream.values {
                items.push(Item {
                    level: extract_level(&message),
                    timestamp,
                    message,
                    labels: stream.stream.clone(),
                });
            }
        }

        items.sort_by_key(|item| item.timestamp_nanos().unwrap_or(i64::MAX));

        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use runway_common::log::Level;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    #[test]
    fn selectors_include_only_set_filters() {
        let query = LogQuery::deployment("p1", "d1");
        assert_eq!(query.selector(), "{project_id=\"p1\", deployment_id=\"d1\"}");

        let query = LogQuery {
            project_id: "p1".into(),
            branch: Some("main".into()),
            keyword: Some("time out.".into()),
            ..Default::default()
        };
        // Keyword search is case-insensitive with regex metacharacters
        // escaped.
        assert_eq!(
            query.selector(),
            "{project_id=\"p1\", branch=\"main\"} |~ \"(?i)time out\\.\""
        );
    }

    #[tokio::test]
    async fn logs_are_merged_across_streams_and_sorted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/loki/api/v1/query_range"))
            .and(query_param("limit", "100"))
            .and(query_param("start", "10"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "success",
                "data": {
                    "resultType": "streams",
                    "result": [
                        {
                            "stream": { "project_id": "p1", "deployment_id": "d1", "stream": "stdout" },
                            "values": [
                                ["3000", "Starting application..."],
                                ["1000", "Cloning acme/blog (Branch: main, Commit: abc1234)"]
                            ]
                        },
                        {
                            "stream": { "project_id": "p1", "deployment_id": "d1", "stream": "stderr" },
                            "values": [["2000", "[error] missing env var"]]
                        }
                    ]
                }
            })))
            .mount(&server)
            .await;

        let client = LokiClient::new(server.uri());
        let mut query = LogQuery::deployment("p1", "d1");
        query.start_timestamp = Some(10);
        let items = client.get_logs(&query).await.unwrap();

        assert_eq!(items.len(), 3);
        assert_eq!(items[0].timestamp, "1000");
        assert_eq!(items[1].timestamp, "2000");
        assert_eq!(items[1].level, Level::Error);
        assert_eq!(items[2].timestamp, "3000");
        assert_eq!(items[0].labels["stream"], "stdout");
    }
}

use anyhow::{anyhow, Context};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

/// Thin client for the managed database's REST surface (`/rest/v1/<table>`).
///
/// Filters use the PostgREST operator syntax, e.g. `("user_id", "eq.abc")`.
#[derive(Clone)]
pub struct StoreClient {
    base_url: String,
    http: reqwest::Client,
}

impl StoreClient {
    pub fn new(base_url: &str, service_key: &str) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            "apikey",
            HeaderValue::from_str(service_key).context("invalid SUPABASE_SERVICE_ROLE_KEY")?,
        );
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", service_key))
                .context("invalid SUPABASE_SERVICE_ROLE_KEY for header")?,
        );

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .context("failed to create store HTTP client")?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    pub async fn select<T: DeserializeOwned>(
        &self,
        table: &str,
        filters: &[(&str, String)],
    ) -> anyhow::Result<Vec<T>> {
        let response = self
            .http
            .get(self.table_url(table))
            .query(&[("select", "*")])
            .query(filters)
            .send()
            .await
            .with_context(|| format!("store select failed for {table}"))?;

        let value = parse_store_response(response, "select", table).await?;
        serde_json::from_value(value)
            .with_context(|| format!("failed to decode store rows for {table}"))
    }

    pub async fn select_one<T: DeserializeOwned>(
        &self,
        table: &str,
        filters: &[(&str, String)],
    ) -> anyhow::Result<Option<T>> {
        let mut filters = filters.to_vec();
        filters.push(("limit", "1".to_string()));
        let rows = self.select::<T>(table, &filters).await?;
        Ok(rows.into_iter().next())
    }

    pub async fn count(&self, table: &str, filters: &[(&str, String)]) -> anyhow::Result<i64> {
        let response = self
            .http
            .head(self.table_url(table))
            .header("Prefer", "count=exact")
            .query(&[("select", "*")])
            .query(filters)
            .send()
            .await
            .with_context(|| format!("store count failed for {table}"))?;

        if !response.status().is_success() {
            return Err(anyhow!(
                "store count on {} failed with status {}",
                table,
                response.status()
            ));
        }

        let range = response
            .headers()
            .get("content-range")
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| anyhow!("store count on {table} returned no Content-Range"))?;

        parse_content_range_total(range)
            .ok_or_else(|| anyhow!("store count on {table} returned bad Content-Range: {range}"))
    }

    /// Inserts `row` and returns the stored representation.
    pub async fn insert<B: Serialize, T: DeserializeOwned>(
        &self,
        table: &str,
        row: &B,
    ) -> anyhow::Result<T> {
        let response = self
            .http
            .post(self.table_url(table))
            .header("Prefer", "return=representation")
            .json(row)
            .send()
            .await
            .with_context(|| format!("store insert failed for {table}"))?;

        let value = parse_store_response(response, "insert", table).await?;
        first_row(value, table)
    }

    /// Insert-or-merge on the `on_conflict` columns. Columns absent from
    /// `row` keep their stored value when the row already exists.
    pub async fn upsert<B: Serialize>(
        &self,
        table: &str,
        on_conflict: &str,
        row: &B,
    ) -> anyhow::Result<()> {
        let response = self
            .http
            .post(self.table_url(table))
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .query(&[("on_conflict", on_conflict)])
            .json(row)
            .send()
            .await
            .with_context(|| format!("store upsert failed for {table}"))?;

        parse_store_response(response, "upsert", table).await?;
        Ok(())
    }

    pub async fn update<B: Serialize>(
        &self,
        table: &str,
        filters: &[(&str, String)],
        patch: &B,
    ) -> anyhow::Result<()> {
        let response = self
            .http
            .patch(self.table_url(table))
            .header("Prefer", "return=minimal")
            .query(filters)
            .json(patch)
            .send()
            .await
            .with_context(|| format!("store update failed for {table}"))?;

        parse_store_response(response, "update", table).await?;
        Ok(())
    }

    pub async fn ping(&self) -> anyhow::Result<()> {
        let response = self
            .http
            .get(format!("{}/rest/v1/", self.base_url))
            .send()
            .await
            .context("store health request failed")?;

        if !response.status().is_success() {
            return Err(anyhow!("store health check returned {}", response.status()));
        }
        Ok(())
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }
}

pub fn eq(value: impl AsRef<str>) -> String {
    format!("eq.{}", value.as_ref())
}

async fn parse_store_response(
    response: reqwest::Response,
    kind: &str,
    table: &str,
) -> anyhow::Result<Value> {
    let status = response.status();
    let text = response
        .text()
        .await
        .with_context(|| format!("failed to read store {} response for {}", kind, table))?;

    if !status.is_success() {
        return Err(anyhow!(
            "store {} on {} failed with status {}: {}",
            kind,
            table,
            status,
            text
        ));
    }

    if text.trim().is_empty() {
        return Ok(Value::Null);
    }

    serde_json::from_str(&text)
        .with_context(|| format!("failed to parse store {} response for {}", kind, table))
}

fn first_row<T: DeserializeOwned>(value: Value, table: &str) -> anyhow::Result<T> {
    let row = match value {
        Value::Array(mut rows) if !rows.is_empty() => rows.swap_remove(0),
        Value::Object(_) => value,
        other => return Err(anyhow!("store returned no row for {}: {}", table, other)),
    };
    serde_json::from_value(row).with_context(|| format!("failed to decode store row for {table}"))
}

/// `Content-Range: 0-9/42` or `*/0` → total.
fn parse_content_range_total(value: &str) -> Option<i64> {
    value.rsplit('/').next()?.trim().parse::<i64>().ok()
}

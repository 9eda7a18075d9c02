use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{info, warn};

use crate::codec;
use crate::config;
use crate::error::{CollectorError, Result};
use crate::version_store::VersionStore;

const DEFAULT_APP_VERSION: &str = "10.7.1";

fn default_headers(app_version: &str) -> BTreeMap<&'static str, String> {
    let mut headers = BTreeMap::new();
    headers.insert("EXCEL-VER", "1.0.0".to_string());
    headers.insert("SHORT-UDID", "1001341751".to_string());
    headers.insert("BATTLE-LOGIC-VERSION", "4".to_string());
    headers.insert("IP-ADDRESS", "10.0.2.15".to_string());
    headers.insert("DEVICE-ID", "febf37270db0254b8d1f76af92f0419f".to_string());
    headers.insert("DEVICE-NAME", "Google PIXEL 2 XL".to_string());
    headers.insert("GRAPHICS-DEVICE-NAME", "Adreno (TM) 540".to_string());
    headers.insert("APP-VER", app_version.to_string());
    headers.insert("RES-KEY", "d145b29050641dac2f8b19df0afe0e59".to_string());
    headers.insert("RES-VER", "10002200".to_string());
    headers.insert("KEYCHAIN", String::new());
    headers.insert("CHANNEL-ID", "4".to_string());
    headers.insert("PLATFORM-ID", "4".to_string());
    headers.insert("REGION-CODE", String::new());
    headers.insert("PLATFORM", "2".to_string());
    headers.insert(
        "PLATFORM-OS-VERSION",
        "Android OS 7.1.2 / API-25 (NOF26V/4565141)".to_string(),
    );
    headers.insert("LOCALE", "Jpn".to_string());
    headers.insert("X-Unity-Version", "2018.4.30f1".to_string());
    headers.insert("BUNDLE_VER", String::new());
    headers.insert("DEVICE", "2".to_string());
    headers.insert(
        "User-Agent",
        "Dalvik/2.1.0 (Linux; U; Android 7.1.2; PIXEL 2 XL Build/NOF26V)".to_string(),
    );
    headers.insert("Accept-Encoding", "gzip, deflate".to_string());
    headers.insert("Connection", "close".to_string());
    headers
}

/// A single upstream RPC session bound to one viewer-id. Owned exclusively by one worker
/// (§9): never share a client across concurrent callers, the session-id/request-id state is
/// not safe for that.
pub struct RpcClient {
    http: reqwest::Client,
    base_url: String,
    headers: BTreeMap<&'static str, String>,
    version_store: Arc<VersionStore>,
    viewer_id: i64,
    request_id: String,
    session_id: String,
    manifest: serde_json::Value,
    uid: String,
    access_key: String,
}

impl RpcClient {
    pub fn new(base_url: impl Into<String>, viewer_id: i64, version_store: Arc<VersionStore>) -> Self {
        let app_version = version_store.get().unwrap_or_else(|| DEFAULT_APP_VERSION.to_string());
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config::RPC_TIMEOUT_SECS))
            .build()
            .expect("the RPC client builder has no fallible configuration here");
        Self {
            http,
            base_url: base_url.into(),
            headers: default_headers(&app_version),
            version_store,
            viewer_id,
            request_id: String::new(),
            session_id: String::new(),
            manifest: serde_json::Value::Null,
            uid: String::new(),
            access_key: String::new(),
        }
    }

    pub fn viewer_id(&self) -> i64 {
        self.viewer_id
    }

    async fn call_api(
        &mut self,
        endpoint: &str,
        mut payload: serde_json::Value,
        encrypted: bool,
    ) -> Result<serde_json::Value> {
        let key = codec::new_session_key();
        let viewer_field = if encrypted {
            codec::encrypt_viewer_id(self.viewer_id, &key)
        } else {
            self.viewer_id.to_string()
        };
        payload
            .as_object_mut()
            .ok_or_else(|| CollectorError::Domain(format!("{endpoint}: payload is not an object")))?
            .insert("viewer_id".to_string(), serde_json::Value::String(viewer_field));

        let body = if encrypted {
            codec::build_request_body(&payload, &key)?
        } else {
            serde_json::to_vec(&payload)
                .map_err(|e| CollectorError::Decode(format!("failed to encode plain request: {e}")))?
        };

        let mut request = self.http.post(format!("{}{endpoint}", self.base_url)).body(body);
        for (name, value) in &self.headers {
            request = request.header(*name, value.as_str());
        }
        if !self.request_id.is_empty() {
            request = request.header("REQUEST-ID", self.request_id.as_str());
        }
        if !self.session_id.is_empty() {
            request = request.header("SID", self.session_id.as_str());
        }

        let response = request.send().await?;
        let raw = response.bytes().await?;

        let result = if encrypted {
            codec::decode_response(&raw)
        } else {
            serde_json::from_slice(&raw).unwrap_or_else(|_| serde_json::json!({}))
        };

        let Some(result) = result.as_object() else {
            warn!(endpoint, "upstream returned a non-map result");
            return Ok(serde_json::json!({}));
        };

        let ret_header = result
            .get("data_headers")
            .and_then(|v| v.as_object())
            .cloned()
            .unwrap_or_default();

        if endpoint == "check/game_start" {
            if let Some(store_url) = ret_header.get("store_url").and_then(|v| v.as_str()) {
                if let Some(new_version) = parse_store_url_version(store_url) {
                    let current = self.headers.get("APP-VER").cloned();
                    if current.as_deref() != Some(new_version.as_str()) {
                        self.version_store.compare_and_set(current.as_deref(), &new_version);
                        self.headers.insert("APP-VER", new_version);
                    }
                }
            }
        }

        if let Some(sid) = ret_header.get("sid").and_then(|v| v.as_str()) {
            self.session_id = codec::derive_session_id(sid);
        }
        if let Some(request_id) = ret_header.get("request_id").and_then(|v| v.as_str()) {
            if request_id != self.request_id {
                self.request_id = request_id.to_string();
            }
        }
        if let Some(viewer_id) = ret_header.get("viewer_id").and_then(value_as_i64) {
            if viewer_id != self.viewer_id {
                self.viewer_id = viewer_id;
            }
        }

        Ok(result
            .get("data")
            .filter(|v| v.is_object())
            .cloned()
            .unwrap_or_else(|| serde_json::json!({})))
    }

    /// Logs in, polling through maintenance windows, then returns the `load/index` and
    /// `home/index` payloads used to seed a fresh session.
    pub async fn login(
        &mut self,
        uid: &str,
        access_key: &str,
    ) -> Result<(serde_json::Value, serde_json::Value)> {
        self.uid = uid.to_string();
        self.access_key = access_key.to_string();
        loop {
            self.manifest = self
                .call_api("source_ini/get_maintenance_status", serde_json::json!({}), false)
                .await?;
            let Some(message) = self.manifest.get("maintenance_message").and_then(|v| v.as_str()) else {
                break;
            };
            match extract_maintenance_end(message) {
                Some(end) => {
                    info!(until = %end, "server is under maintenance, waiting it out");
                    let now = chrono::Utc::now();
                    if end > now {
                        tokio::time::sleep((end - now).to_std().unwrap_or(Duration::from_secs(
                            config::MAINTENANCE_FALLBACK_SLEEP_SECS,
                        )))
                        .await;
                    }
                }
                None => {
                    warn!("server is under maintenance with no parseable end time, retrying later");
                    tokio::time::sleep(Duration::from_secs(config::MAINTENANCE_FALLBACK_SLEEP_SECS)).await;
                }
            }
        }

        if let Some(manifest_ver) = self.manifest.get("required_manifest_ver").and_then(|v| v.as_str()) {
            self.headers.insert("MANIFEST-VER", manifest_ver.to_string());
        }

        self.sdk_login(uid, access_key).await?;
        self.game_start().await?;

        let load = self.call_api("load/index", serde_json::json!({"carrier": "google"}), true).await?;
        let mut home = self
            .call_api(
                "home/index",
                serde_json::json!({
                    "message_id": random_range(1, 5000),
                    "tips_id_list": [],
                    "is_first": 1,
                    "gold_history": 0,
                }),
                true,
            )
            .await?;

        if home.get("server_error").is_some() {
            self.sdk_login(uid, access_key).await?;
            self.game_start().await?;
            home = self
                .call_api(
                    "home/index",
                    serde_json::json!({
                        "message_id": random_range(1, 5000),
                        "tips_id_list": [],
                        "is_first": 1,
                        "gold_history": 0,
                    }),
                    true,
                )
                .await?;
        }

        Ok((load, home))
    }

    async fn sdk_login(&mut self, uid: &str, access_key: &str) -> Result<serde_json::Value> {
        let platform = self.headers.get("PLATFORM-ID").cloned().unwrap_or_default();
        let channel_id = self.headers.get("CHANNEL-ID").cloned().unwrap_or_default();
        self.call_api(
            "tool/sdk_login",
            serde_json::json!({
                "uid": uid,
                "access_key": access_key,
                "platform": platform,
                "channel_id": channel_id,
            }),
            true,
        )
        .await
    }

    async fn game_start(&mut self) -> Result<serde_json::Value> {
        self.call_api(
            "check/game_start",
            serde_json::json!({
                "app_type": 0,
                "campaign_data": "",
                "campaign_user": random_range(1, 1_000_000),
            }),
            true,
        )
        .await
    }

    /// Retries a transport failure once, logging back in first, before surfacing the
    /// caller-visible empty map (§4.2's "failures surface as an empty map").
    async fn call(&mut self, endpoint: &str, payload: serde_json::Value) -> serde_json::Value {
        match self.call_api(endpoint, payload.clone(), true).await {
            Ok(value) => value,
            Err(e) => {
                warn!(endpoint, error = %e, "transport error, relogging in and retrying once");
                let uid = self.uid.clone();
                let access_key = self.access_key.clone();
                if self.login(&uid, &access_key).await.is_err() {
                    return serde_json::json!({});
                }
                self.call_api(endpoint, payload, true).await.unwrap_or_else(|e| {
                    warn!(endpoint, error = %e, "retry after relogin also failed");
                    serde_json::json!({})
                })
            }
        }
    }

    pub async fn get_profile(&mut self, target_viewer_id: i64) -> serde_json::Value {
        self.call("profile/get_profile", serde_json::json!({"target_viewer_id": target_viewer_id})).await
    }

    pub async fn clan_others_info(&mut self, clan_id: i64) -> serde_json::Value {
        self.call("clan/others_info", serde_json::json!({"clan_id": clan_id})).await
    }

    pub async fn arena_ranking(&mut self, group: i32, page: u32) -> serde_json::Value {
        self.call("arena/ranking", serde_json::json!({"arena_group": group, "page": page})).await
    }

    pub async fn grand_arena_ranking(&mut self, group: i32, page: u32) -> serde_json::Value {
        self.call(
            "grand_arena/ranking",
            serde_json::json!({
                "grand_arena_group": group,
                "page": page,
                "count": config::GRAND_ARENA_PAGE_SIZE,
            }),
        )
        .await
    }

    pub async fn arena_info(&mut self) -> serde_json::Value {
        self.call("arena/info", serde_json::json!({})).await
    }

    pub async fn grand_arena_info(&mut self) -> serde_json::Value {
        self.call("grand_arena/info", serde_json::json!({})).await
    }

    pub async fn clan_battle_period_ranking(&mut self) -> serde_json::Value {
        self.call("clan_battle/period_ranking", serde_json::json!({})).await
    }
}

fn random_range(low: i64, high: i64) -> i64 {
    rand::thread_rng().gen_range(low..=high)
}

fn value_as_i64(value: &serde_json::Value) -> Option<i64> {
    value.as_i64().or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

/// `store_url` looks like `.../something_10.7.2.apk`; the version is the segment after the
/// first underscore with the trailing 4-character extension dropped.
fn parse_store_url_version(store_url: &str) -> Option<String> {
    let after_underscore = store_url.split('_').nth(1)?;
    if after_underscore.len() <= 4 {
        return None;
    }
    Some(after_underscore[..after_underscore.len() - 4].to_string())
}

fn extract_maintenance_end(message: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    let pattern = regex_lite_match(message)?;
    chrono::NaiveDateTime::parse_from_str(&pattern, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Finds the first `YYYY-MM-DD HH:MM:SS` substring without pulling in a regex dependency the
/// rest of the crate has no other use for. Upstream maintenance messages are routinely CJK
/// text surrounding the timestamp, so this scans raw bytes throughout and only ever builds a
/// `&str` from a window already confirmed to be ASCII-digit-shaped — slicing `message` itself
/// by an unvalidated byte offset could land mid-codepoint and panic.
fn regex_lite_match(message: &str) -> Option<String> {
    let bytes = message.as_bytes();
    let pattern_len = "0000-00-00 00:00:00".len();
    if bytes.len() < pattern_len {
        return None;
    }
    for start in 0..=(bytes.len() - pattern_len) {
        let candidate = &bytes[start..start + pattern_len];
        if is_timestamp_shaped(candidate) {
            return std::str::from_utf8(candidate).ok().map(str::to_string);
        }
    }
    None
}

fn is_timestamp_shaped(candidate: &[u8]) -> bool {
    let digit_positions = [0, 1, 2, 3, 5, 6, 8, 9, 11, 12, 14, 15, 17, 18];
    let literal_positions = [(4, b'-'), (7, b'-'), (10, b' '), (13, b':'), (16, b':')];
    digit_positions.iter().all(|&i| candidate[i].is_ascii_digit())
        && literal_positions.iter().all(|&(i, c)| candidate[i] == c)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_version_out_of_a_store_url() {
        assert_eq!(
            parse_store_url_version("https://example.com/app_10.7.2.apk"),
            Some("10.7.2".to_string())
        );
    }

    #[test]
    fn store_url_without_an_underscore_segment_yields_none() {
        assert_eq!(parse_store_url_version("https://example.com/app.apk"), None);
    }

    #[test]
    fn extracts_a_maintenance_end_timestamp_from_surrounding_text() {
        let message = "maintenance until 2026-08-01 03:00:00 please wait";
        let end = extract_maintenance_end(message).expect("should find a timestamp");
        assert_eq!(end.to_string(), "2026-08-01 03:00:00 UTC");
    }

    #[test]
    fn returns_none_when_no_timestamp_is_present() {
        assert_eq!(extract_maintenance_end("no timestamp here"), None);
    }

    #[test]
    fn extracts_a_timestamp_from_a_multibyte_cjk_prefixed_message() {
        let message = "维护中2026-08-01 03:00:00预计结束";
        let end = extract_maintenance_end(message).expect("should find a timestamp");
        assert_eq!(end.to_string(), "2026-08-01 03:00:00 UTC");
    }
}

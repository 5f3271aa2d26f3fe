//! Dr.COM "eportal" captive-portal client.
//!
//! Every call is a single GET; read endpoints answer in JSONP
//! (`dr1004({...});`). Nothing here retries: that is the reconciler's call.

use std::future::Future;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::OnceLock;

use regex::Regex;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;

use crate::config::PortalConfig;
use crate::error::{Error, Result};
use crate::model::{DeviceRecord, Identity, InterfaceKind, LoginResult, PublicAddress};

/// `ret_code` the portal uses for "this address is already signed in".
const RET_ALREADY_ONLINE: i64 = 2;

pub trait Portal: Send + Sync + 'static {
    fn fetch_identity(&self) -> impl Future<Output = Result<Identity>> + Send;

    fn fetch_public_ip(&self) -> impl Future<Output = Result<PublicAddress>> + Send;

    fn fetch_active_devices(
        &self,
        account_id: &str,
    ) -> impl Future<Output = Result<Vec<DeviceRecord>>> + Send;

    fn login(
        &self,
        account_id: &str,
        password: &str,
        interface: InterfaceKind,
    ) -> impl Future<Output = Result<LoginResult>> + Send;

    fn logout(&self, account_id: &str) -> impl Future<Output = Result<LoginResult>> + Send;
}

/// HTTP implementation of [`Portal`].
#[derive(Clone, Debug)]
pub struct PortalClient {
    http: reqwest::Client,
    landing_url: String,
    eportal_url: String,
    ip_lookup_url: String,
}

impl PortalClient {
    pub fn new(config: &PortalConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .map_err(|source| Error::Connectivity {
                endpoint: "HTTP client".into(),
                source,
            })?;
        Ok(Self::with_client(http, config))
    }

    pub fn with_client(http: reqwest::Client, config: &PortalConfig) -> Self {
        Self {
            http,
            landing_url: config.landing_url.clone(),
            eportal_url: config.eportal_url.trim_end_matches('/').to_string(),
            ip_lookup_url: config.ip_lookup_url.clone(),
        }
    }

    /// Devices bound to `account_id` (the `mac/custom` endpoint), as returned.
    pub async fn fetch_mac_bindings(&self, account_id: &str) -> Result<Value> {
        let url = self.eportal(&["mac", "custom"], &mac_bindings_params(account_id))?;
        let body = self.get_text(url).await?;
        parse_jsonp(&body)
    }

    fn eportal(&self, path: &[&str], params: &[(&str, &str)]) -> Result<Url> {
        let base = format!("{}/{}", self.eportal_url, path.join("/"));
        Url::parse_with_params(&base, params).map_err(|e| Error::parse("portal URL", e.to_string()))
    }

    async fn get_text(&self, url: Url) -> Result<String> {
        let endpoint = endpoint_label(&url);
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|source| Error::Connectivity {
                endpoint: endpoint.clone(),
                source: source.without_url(),
            })?;
        let status = response.status();
        if status != StatusCode::OK {
            return Err(Error::PortalStatus {
                endpoint,
                status: status.as_u16(),
            });
        }
        response.text().await.map_err(|source| Error::Connectivity {
            endpoint,
            source: source.without_url(),
        })
    }
}

impl Portal for PortalClient {
    async fn fetch_identity(&self) -> Result<Identity> {
        let url = Url::parse(&self.landing_url)
            .map_err(|e| Error::parse("landing URL", e.to_string()))?;
        let html = self.get_text(url).await?;
        let identity = parse_identity(&html);
        tracing::debug!(
            "Portal identity: uid={:?} v4ip={:?}",
            identity.account_id,
            identity.ipv4
        );
        Ok(identity)
    }

    async fn fetch_public_ip(&self) -> Result<PublicAddress> {
        let url = Url::parse(&self.ip_lookup_url)
            .map_err(|e| Error::parse("IP lookup URL", e.to_string()))?;
        let text = self.get_text(url).await?;
        Ok(parse_public_address(&text))
    }

    async fn fetch_active_devices(&self, account_id: &str) -> Result<Vec<DeviceRecord>> {
        let url = self.eportal(&["page", "loadOnlineRecord"], &online_record_params(account_id))?;
        let body = self.get_text(url).await?;
        parse_devices(&body)
    }

    async fn login(
        &self,
        account_id: &str,
        password: &str,
        interface: InterfaceKind,
    ) -> Result<LoginResult> {
        tracing::info!("Sign in: account {} via {} interface", account_id, interface);
        let url = self.eportal(&["login"], &login_params(account_id, password))?;
        let body = self.get_text(url).await?;
        let result = parse_login_reply(&body);
        tracing::debug!("login reply: {}", result.raw_response_text);
        Ok(result)
    }

    async fn logout(&self, account_id: &str) -> Result<LoginResult> {
        tracing::info!("Sign out requested by account {}", account_id);
        let url = self.eportal(&["logout"], &logout_params())?;
        let body = self.get_text(url).await?;
        let result = parse_login_reply(&body);
        tracing::debug!("logout reply: {}", result.raw_response_text);
        Ok(result)
    }
}

impl LoginResult {
    /// Turn a portal-reported failure into [`Error::PortalRejected`].
    pub fn into_result(self) -> Result<Self> {
        if self.success {
            Ok(self)
        } else {
            Err(Error::PortalRejected {
                code: self.code,
                message: self.message.unwrap_or_else(|| self.raw_response_text.clone()),
            })
        }
    }
}

/// `scheme://host[:port]/path` without the query, which may carry a password.
fn endpoint_label(url: &Url) -> String {
    let mut label = url.clone();
    label.set_query(None);
    label.to_string()
}

// ── Request parameters ──────────────────────────────────────────────
// Literal values must match what the portal's own JavaScript sends.

pub fn login_params<'a>(account_id: &'a str, password: &'a str) -> Vec<(&'static str, &'a str)> {
    vec![
        ("callback", "dr1003"),
        ("login_method", "1"),
        ("user_account", account_id),
        ("user_password", password),
        ("wlan_user_ip", "0.0.0.0"),
        ("wlan_user_ipv6", ""),
        ("wlan_user_mac", ""),
        ("wlan_ac_ip", ""),
        ("wlan_ac_name", ""),
        ("jsVersion", "4.1"),
        ("terminal_type", "1"),
        ("lang", "zh-cn"),
        ("v", "5927"),
        ("lang", "zh"),
    ]
}

/// Logout always names the portal's placeholder account; the portal signs out the caller's IP.
pub fn logout_params() -> Vec<(&'static str, &'static str)> {
    vec![
        ("callback", "dr1006"),
        ("login_method", "1"),
        ("user_account", "drcom"),
        ("user_password", "123"),
        ("ac_logout", "0"),
        ("register_mode", "1"),
        ("wlan_user_ip", "0.0.0.0"),
        ("wlan_user_ipv6", ""),
        ("wlan_vlan_id", "1"),
        ("wlan_user_mac", "000000000000"),
        ("wlan_ac_ip", ""),
        ("wlan_ac_name", ""),
        ("jsVersion", "4.1"),
        ("bas_ip", "xha.ouc.edu.cn"),
        ("type", "1"),
        ("v", "1798"),
        ("lang", "zh"),
    ]
}

pub fn online_record_params(account_id: &str) -> Vec<(&'static str, &str)> {
    vec![
        ("callback", "dr1004"),
        ("lang", "zh-CN"),
        ("program_index", "ctshNw1713845951"),
        ("page_index", "V5fmKw1713845966"),
        ("user_account", account_id),
        ("wlan_user_ip", "0.0.0.0"),
        ("wlan_user_mac", "000000000000"),
        ("start_time", "2010-01-01"),
        ("end_time", "2100-01-01"),
        ("start_rn", "1"),
        ("end_rn", "5"),
        ("jsVersion", "4.1"),
        ("v", "3747"),
        ("lang", "zh"),
    ]
}

pub fn mac_bindings_params(account_id: &str) -> Vec<(&'static str, &str)> {
    vec![
        ("callback", "dr1002"),
        ("lang", "zh-CN"),
        ("program_index", "ctshNw1713845951"),
        ("page_index", "V5fmKw1713845966"),
        ("user_account", account_id),
        ("wlan_user_ip", "0.0.0.0"),
        ("wlan_user_mac", "000000000000"),
        ("jsVersion", "4.1"),
        ("v", "8569"),
        ("lang", "zh"),
    ]
}

// ── Response parsing ────────────────────────────────────────────────

fn regex(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("valid regex"))
}

/// Pull `uid='…'` and `v4ip='…'` out of the landing page's inline scripts.
pub fn parse_identity(html: &str) -> Identity {
    static SCRIPT: OnceLock<Regex> = OnceLock::new();
    static UID: OnceLock<Regex> = OnceLock::new();
    static V4IP: OnceLock<Regex> = OnceLock::new();
    let script = regex(&SCRIPT, r"(?is)<script[^>]*>(.*?)</script>");
    let uid = regex(&UID, r"uid='([^']+)'");
    let v4ip = regex(&V4IP, r"v4ip='([^']+)'");

    let mut identity = Identity::default();
    let mut ipv4_text: Option<String> = None;
    for block in script.captures_iter(html) {
        let Some(body) = block.get(1).map(|m| m.as_str()) else {
            continue;
        };
        if identity.account_id.is_none() {
            identity.account_id = uid.captures(body).map(|c| c[1].to_string());
        }
        if ipv4_text.is_none() {
            ipv4_text = v4ip.captures(body).map(|c| c[1].to_string());
        }
        if identity.account_id.is_some() && ipv4_text.is_some() {
            break;
        }
    }
    identity.ipv4 = ipv4_text.and_then(|s| match s.parse::<Ipv4Addr>() {
        Ok(ip) => Some(ip),
        Err(_) => {
            tracing::debug!("Portal v4ip {:?} is not an IPv4 address", s);
            None
        }
    });
    identity
}

/// First full IPv6 and first IPv4 mentioned on the lookup page.
pub fn parse_public_address(text: &str) -> PublicAddress {
    static V6: OnceLock<Regex> = OnceLock::new();
    static V4: OnceLock<Regex> = OnceLock::new();
    let v6 = regex(&V6, r"(?:[0-9a-fA-F]{1,4}:){7}[0-9a-fA-F]{1,4}");
    let v4 = regex(&V4, r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}\b");

    PublicAddress {
        ipv4: v4
            .find_iter(text)
            .find_map(|m| m.as_str().parse::<Ipv4Addr>().ok()),
        ipv6: v6
            .find_iter(text)
            .find_map(|m| m.as_str().parse::<Ipv6Addr>().ok()),
    }
}

/// Strip the `callback( … );` wrapper, returning the JSON text inside.
pub fn unwrap_jsonp(body: &str) -> Result<&str> {
    static JSONP: OnceLock<Regex> = OnceLock::new();
    let jsonp = regex(&JSONP, r"(?s)^\s*[A-Za-z_$][\w$]*\((.*)\)\s*;?\s*$");
    jsonp
        .captures(body)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .ok_or_else(|| Error::parse("JSONP body", "no callback(...) wrapper"))
}

pub fn parse_jsonp(body: &str) -> Result<Value> {
    let json = unwrap_jsonp(body)?;
    serde_json::from_str(json).map_err(|e| Error::parse("JSONP payload", e.to_string()))
}

pub fn parse_devices(body: &str) -> Result<Vec<DeviceRecord>> {
    let payload = parse_jsonp(body)?;
    match payload.get("records") {
        Some(Value::Array(records)) => Ok(records.iter().map(device_from_record).collect()),
        Some(Value::Null) | None => Ok(Vec::new()),
        Some(other) => Err(Error::parse(
            "online records",
            format!("`records` is not a list: {}", other),
        )),
    }
}

/// Record field names vary between portal versions; take the first present.
fn device_from_record(record: &Value) -> DeviceRecord {
    let field = |keys: &[&str]| -> Option<String> {
        keys.iter().find_map(|k| match record.get(*k)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
    };
    DeviceRecord {
        name: field(&["device_name", "terminal_name", "name", "online_mac", "mac"])
            .unwrap_or_default(),
        kind: field(&["terminal_type", "device_type", "type"]).unwrap_or_default(),
        status: field(&["online_status", "status"]).unwrap_or_else(|| "Online".into()),
        ip: field(&["online_ip", "user_ip", "ip", "IP"]).unwrap_or_default(),
    }
}

#[derive(Debug, Deserialize)]
struct Reply {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    ret_code: Value,
}

fn as_code(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Decode a login/logout reply. `result == 1` or "already online" counts as success;
/// an undecodable body falls back to trusting the HTTP 200 it arrived with.
pub fn parse_login_reply(body: &str) -> LoginResult {
    let reply = unwrap_jsonp(body)
        .ok()
        .and_then(|json| serde_json::from_str::<Reply>(json).ok());
    match reply {
        Some(reply) => {
            let code = as_code(&reply.result);
            let ret_code = as_code(&reply.ret_code);
            LoginResult {
                success: code == Some(1) || ret_code == Some(RET_ALREADY_ONLINE),
                code,
                message: reply.msg.filter(|m| !m.is_empty()),
                raw_response_text: body.to_string(),
            }
        }
        None => {
            tracing::warn!("Portal reply not understood, trusting HTTP 200");
            LoginResult {
                success: true,
                code: None,
                message: None,
                raw_response_text: body.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn jsonp_unwrap_empty_records() {
        let devices = parse_devices(r#"dr1004({"records":[]});"#).unwrap();
        assert!(devices.is_empty());
        assert_eq!(unwrap_jsonp("dr1004({\"records\":[]});").unwrap(), "{\"records\":[]}");
    }

    #[test]
    fn jsonp_without_wrapper_is_parse_error() {
        for body in [r#"{"records":[]}"#, "<html>502 Bad Gateway</html>", "", "dr1004{}"] {
            let err = parse_devices(body).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Parse, "body {:?}", body);
        }
    }

    #[test]
    fn jsonp_with_bad_json_is_parse_error() {
        let err = parse_devices("dr1004({records:});").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Parse);
    }

    #[test]
    fn device_records_read_leniently() {
        let body = r#"dr1004({"result":1,"records":[
            {"online_ip":"10.100.30.5","online_mac":"A483E7001122","terminal_type":1,"online_status":"在线"},
            {"device_name":"DESKTOP-BBBBBB","ip":"10.100.30.6","type":"PC"}
        ]});"#;
        let devices = parse_devices(body).unwrap();
        assert_eq!(
            devices,
            vec![
                DeviceRecord {
                    name: "A483E7001122".into(),
                    kind: "1".into(),
                    status: "在线".into(),
                    ip: "10.100.30.5".into(),
                },
                DeviceRecord {
                    name: "DESKTOP-BBBBBB".into(),
                    kind: "PC".into(),
                    status: "Online".into(),
                    ip: "10.100.30.6".into(),
                },
            ]
        );
    }

    #[test]
    fn identity_from_inline_script() {
        let html = r#"<html><head>
            <script src="a.js"></script>
            <script type="text/javascript">var ss5="";uid='u2021001';pwd='';</script>
            <script>v46m=0;v4ip='10.1.2.3';v6ip='';</script>
            </head><body>uid='not-in-script'</body></html>"#;
        let identity = parse_identity(html);
        assert_eq!(identity.account_id.as_deref(), Some("u2021001"));
        assert_eq!(identity.ipv4, Some(Ipv4Addr::new(10, 1, 2, 3)));
    }

    #[test]
    fn identity_absent() {
        let identity = parse_identity("<html><body>uid='x'</body></html>");
        assert_eq!(identity, Identity::default());
    }

    #[test]
    fn public_address_prefers_full_ipv6() {
        let page = "Your IP: 2001:da8:7001:1234:5678:9abc:def0:1 / 10.1.2.3";
        let addr = parse_public_address(page);
        assert_eq!(addr.ipv6, Some("2001:da8:7001:1234:5678:9abc:def0:1".parse().unwrap()));
        assert_eq!(addr.ipv4, Some(Ipv4Addr::new(10, 1, 2, 3)));

        let addr = parse_public_address("当前IP: 10.9.8.7");
        assert_eq!(addr.ipv6, None);
        assert_eq!(addr.ipv4, Some(Ipv4Addr::new(10, 9, 8, 7)));
    }

    #[test]
    fn login_reply_codes() {
        let ok = parse_login_reply(r#"dr1003({"result":1,"msg":"Portal协议认证成功！"});"#);
        assert!(ok.success);
        assert_eq!(ok.code, Some(1));

        let already = parse_login_reply(r#"dr1003({"result":0,"msg":"","ret_code":2});"#);
        assert!(already.success);
        assert_eq!(already.message, None);

        let bad = parse_login_reply(r#"dr1003({"result":"0","msg":"账号或密码错误","ret_code":1});"#);
        assert!(!bad.success);
        assert_eq!(bad.code, Some(0));
        let err = bad.into_result().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Portal);
        assert!(err.to_string().contains("账号或密码错误"));

        let opaque = parse_login_reply("ok");
        assert!(opaque.success);
        assert_eq!(opaque.code, None);
    }

    #[test]
    fn login_url_is_exact() {
        let url = Url::parse_with_params(
            "https://xha.ouc.edu.cn:802/eportal/portal/login",
            &login_params("u2021001", "pa ss&word"),
        )
        .unwrap();
        assert_eq!(
            url.query(),
            Some(
                "callback=dr1003&login_method=1&user_account=u2021001&user_password=pa+ss%26word\
                 &wlan_user_ip=0.0.0.0&wlan_user_ipv6=&wlan_user_mac=&wlan_ac_ip=&wlan_ac_name=\
                 &jsVersion=4.1&terminal_type=1&lang=zh-cn&v=5927&lang=zh"
            )
        );
    }

    #[test]
    fn logout_url_is_exact() {
        let url = Url::parse_with_params(
            "https://xha.ouc.edu.cn:802/eportal/portal/logout",
            &logout_params(),
        )
        .unwrap();
        assert_eq!(
            url.query(),
            Some(
                "callback=dr1006&login_method=1&user_account=drcom&user_password=123&ac_logout=0\
                 &register_mode=1&wlan_user_ip=0.0.0.0&wlan_user_ipv6=&wlan_vlan_id=1\
                 &wlan_user_mac=000000000000&wlan_ac_ip=&wlan_ac_name=&jsVersion=4.1\
                 &bas_ip=xha.ouc.edu.cn&type=1&v=1798&lang=zh"
            )
        );
    }

    #[test]
    fn endpoint_label_drops_query() {
        let url = Url::parse("https://xha.ouc.edu.cn:802/eportal/portal/login?user_password=secret")
            .unwrap();
        assert_eq!(
            endpoint_label(&url),
            "https://xha.ouc.edu.cn:802/eportal/portal/login"
        );
    }
}

//! HTTP Digest 认证（RFC 2617 / RFC 7616）
//!
//! 设备在返回事件流前要求 Digest 认证：首个请求得到 401 与质询，
//! 据此计算 `Authorization` 头后重发请求。

use md5::Md5;
use sha2::{Digest, Sha256};

/// 质询中声明的摘要算法
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Md5,
    Md5Sess,
    Sha256,
    Sha256Sess,
}

impl DigestAlgorithm {
    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "MD5" => Some(Self::Md5),
            "MD5-SESS" => Some(Self::Md5Sess),
            "SHA-256" => Some(Self::Sha256),
            "SHA-256-SESS" => Some(Self::Sha256Sess),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Md5 => "MD5",
            Self::Md5Sess => "MD5-sess",
            Self::Sha256 => "SHA-256",
            Self::Sha256Sess => "SHA-256-sess",
        }
    }

    fn is_session(&self) -> bool {
        matches!(self, Self::Md5Sess | Self::Sha256Sess)
    }

    fn hash(&self, data: &str) -> String {
        match self {
            Self::Md5 | Self::Md5Sess => hex::encode(Md5::digest(data.as_bytes())),
            Self::Sha256 | Self::Sha256Sess => hex::encode(Sha256::digest(data.as_bytes())),
        }
    }
}

/// 解析后的 `WWW-Authenticate: Digest ...` 质询
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    /// 服务端提供 `auth` 时为 true
    pub qop_auth: bool,
    pub algorithm: DigestAlgorithm,
}

impl DigestChallenge {
    /// 解析质询头；不是 Digest 方案、缺少 nonce 或算法不受支持时返回 None
    pub fn parse(header: &str) -> Option<Self> {
        let header = header.trim();
        let (scheme, rest) = header.split_once(char::is_whitespace)?;
        if !scheme.eq_ignore_ascii_case("digest") {
            return None;
        }

        let mut realm = String::new();
        let mut nonce = None;
        let mut opaque = None;
        let mut qop_auth = false;
        let mut algorithm = DigestAlgorithm::Md5;

        for (key, value) in parse_params(rest) {
            match key.to_ascii_lowercase().as_str() {
                "realm" => realm = value,
                "nonce" => nonce = Some(value),
                "opaque" => opaque = Some(value),
                "qop" => {
                    qop_auth = value
                        .split(',')
                        .any(|q| q.trim().eq_ignore_ascii_case("auth"));
                }
                "algorithm" => algorithm = DigestAlgorithm::parse(&value)?,
                _ => {}
            }
        }

        Some(Self {
            realm,
            nonce: nonce?,
            opaque,
            qop_auth,
            algorithm,
        })
    }

    /// 生成 `Authorization` 头的值（随机 cnonce）
    pub fn authorize(&self, method: &str, uri: &str, username: &str, password: &str) -> String {
        let cnonce = format!("{:016x}", fastrand::u64(..));
        self.authorize_with(method, uri, username, password, &cnonce, 1)
    }

    /// 使用指定的 cnonce 与 nonce-count 生成 `Authorization` 头的值
    pub fn authorize_with(
        &self,
        method: &str,
        uri: &str,
        username: &str,
        password: &str,
        cnonce: &str,
        nc: u32,
    ) -> String {
        let algo = self.algorithm;
        let nc = format!("{:08x}", nc);

        let mut ha1 = algo.hash(&format!("{}:{}:{}", username, self.realm, password));
        if algo.is_session() {
            ha1 = algo.hash(&format!("{}:{}:{}", ha1, self.nonce, cnonce));
        }
        let ha2 = algo.hash(&format!("{}:{}", method, uri));

        let response = if self.qop_auth {
            algo.hash(&format!(
                "{}:{}:{}:{}:auth:{}",
                ha1, self.nonce, nc, cnonce, ha2
            ))
        } else {
            algo.hash(&format!("{}:{}:{}", ha1, self.nonce, ha2))
        };

        let mut header = format!(
            r#"Digest username="{}", realm="{}", nonce="{}", uri="{}", algorithm={}, response="{}""#,
            username,
            self.realm,
            self.nonce,
            uri,
            algo.name(),
            response
        );
        if let Some(opaque) = &self.opaque {
            header.push_str(&format!(r#", opaque="{}""#, opaque));
        }
        if self.qop_auth {
            header.push_str(&format!(r#", qop=auth, nc={}, cnonce="{}""#, nc, cnonce));
        }
        header
    }
}

/// 解析 `key=value, key="quoted, value"` 形式的参数列表
fn parse_params(input: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let mut chars = input.chars().peekable();

    loop {
        // 跳过分隔符与空白
        while matches!(chars.peek(), Some(c) if *c == ',' || c.is_whitespace()) {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let mut key = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' || c == ',' {
                break;
            }
            key.push(c);
            chars.next();
        }
        let key = key.trim().to_string();

        let mut value = String::new();
        if chars.peek() == Some(&'=') {
            chars.next();
            while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
                chars.next();
            }
            if chars.peek() == Some(&'"') {
                chars.next();
                while let Some(c) = chars.next() {
                    match c {
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                value.push(escaped);
                            }
                        }
                        '"' => break,
                        _ => value.push(c),
                    }
                }
            } else {
                while let Some(&c) = chars.peek() {
                    if c == ',' {
                        break;
                    }
                    value.push(c);
                    chars.next();
                }
                value = value.trim().to_string();
            }
        }

        if !key.is_empty() {
            params.push((key, value));
        }
    }

    params
}

#[cfg(test)]
mod tests {
    use super::*;

    const RFC2617_CHALLENGE: &str = r#"Digest realm="testrealm@host.com", qop="auth,auth-int", nonce="dcd98b7102dd2f0e8b11d0f600bfb0c093", opaque="5ccc069c403ebaf9f0171e9517f40e41""#;

    #[test]
    fn test_parse_challenge() {
        let challenge = DigestChallenge::parse(RFC2617_CHALLENGE).unwrap();
        assert_eq!(challenge.realm, "testrealm@host.com");
        assert_eq!(challenge.nonce, "dcd98b7102dd2f0e8b11d0f600bfb0c093");
        assert_eq!(
            challenge.opaque.as_deref(),
            Some("5ccc069c403ebaf9f0171e9517f40e41")
        );
        assert!(challenge.qop_auth);
        assert_eq!(challenge.algorithm, DigestAlgorithm::Md5);
    }

    /// RFC 2617 第 3.5 节的示例
    #[test]
    fn test_rfc2617_response() {
        let challenge = DigestChallenge::parse(RFC2617_CHALLENGE).unwrap();
        let header = challenge.authorize_with(
            "GET",
            "/dir/index.html",
            "Mufasa",
            "Circle Of Life",
            "0a4f113b",
            1,
        );

        assert!(header.starts_with("Digest "));
        assert!(header.contains(r#"response="6629fae49393a05397450978507c4ef1""#));
        assert!(header.contains("nc=00000001"));
        assert!(header.contains(r#"cnonce="0a4f113b""#));
        assert!(header.contains(r#"opaque="5ccc069c403ebaf9f0171e9517f40e41""#));
    }

    #[test]
    fn test_parse_rejects_basic_scheme() {
        assert!(DigestChallenge::parse(r#"Basic realm="device""#).is_none());
    }

    #[test]
    fn test_parse_requires_nonce() {
        assert!(DigestChallenge::parse(r#"Digest realm="device""#).is_none());
    }

    #[test]
    fn test_parse_unquoted_algorithm_and_sha256() {
        let challenge =
            DigestChallenge::parse(r#"Digest realm="IP Camera", nonce="abc", algorithm=SHA-256"#)
                .unwrap();
        assert_eq!(challenge.algorithm, DigestAlgorithm::Sha256);
        assert!(!challenge.qop_auth);

        let header = challenge.authorize_with("GET", "/ISAPI", "admin", "pw", "c", 1);
        assert!(header.contains("algorithm=SHA-256"));
        assert!(!header.contains("qop="));
        // SHA-256 十六进制摘要长度为 64
        let response = header
            .split("response=\"")
            .nth(1)
            .and_then(|s| s.split('"').next())
            .unwrap();
        assert_eq!(response.len(), 64);
    }

    #[test]
    fn test_parse_quoted_value_with_comma() {
        let params = parse_params(r#"realm="a, b", nonce=xyz"#);
        assert_eq!(params[0], ("realm".to_string(), "a, b".to_string()));
        assert_eq!(params[1], ("nonce".to_string(), "xyz".to_string()));
    }

    #[test]
    fn test_authorize_generates_fresh_cnonce() {
        let challenge = DigestChallenge::parse(RFC2617_CHALLENGE).unwrap();
        let a = challenge.authorize("GET", "/", "u", "p");
        let b = challenge.authorize("GET", "/", "u", "p");
        assert_ne!(a, b);
    }
}

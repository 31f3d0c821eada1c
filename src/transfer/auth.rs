use std::time::{SystemTime, UNIX_EPOCH};

/// Credential holder attached to a transfer. Construction is the caller's
/// business (CLI prompt, config, embedding application); the transport
/// only applies it.
#[derive(Debug, Clone)]
pub enum Credentials {
    Basic { username: String, password: String },
    Digest { username: String, password: String },
}

impl Credentials {
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Basic {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn digest(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Digest {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// A parsed `WWW-Authenticate: Digest …` challenge (RFC 2617).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    pub qop: Option<String>,
    pub algorithm: Option<String>,
}

impl DigestChallenge {
    pub fn parse(header: &str) -> Option<Self> {
        let header = header.trim();
        if header.len() < 7 || !header[..6].eq_ignore_ascii_case("digest") {
            return None;
        }

        let mut realm = None;
        let mut nonce = None;
        let mut opaque = None;
        let mut qop = None;
        let mut algorithm = None;

        for (key, value) in parse_params(&header[6..]) {
            match key.as_str() {
                "realm" => realm = Some(value),
                "nonce" => nonce = Some(value),
                "opaque" => opaque = Some(value),
                "qop" => qop = Some(value),
                "algorithm" => algorithm = Some(value),
                _ => {}
            }
        }

        Some(Self {
            realm: realm?,
            nonce: nonce?,
            opaque,
            qop,
            algorithm,
        })
    }

    /// Builds the `Authorization` header value answering this challenge.
    pub fn respond(&self, username: &str, password: &str, method: &str, uri: &str) -> String {
        let entropy = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let cnonce = md5_hex(format!("{}{}", self.nonce, entropy));
        self.respond_with(username, password, method, uri, &cnonce)
    }

    fn supports_auth_qop(&self) -> bool {
        self.qop
            .as_deref()
            .map(|qop| qop.split(',').any(|item| item.trim() == "auth"))
            .unwrap_or(false)
    }

    fn respond_with(
        &self,
        username: &str,
        password: &str,
        method: &str,
        uri: &str,
        cnonce: &str,
    ) -> String {
        let ha1 = md5_hex(format!("{username}:{}:{password}", self.realm));
        let ha2 = md5_hex(format!("{method}:{uri}"));

        let mut header = format!(
            "Digest username=\"{username}\", realm=\"{}\", nonce=\"{}\", uri=\"{uri}\"",
            self.realm, self.nonce
        );

        let response = if self.supports_auth_qop() {
            let response = md5_hex(format!(
                "{ha1}:{}:00000001:{cnonce}:auth:{ha2}",
                self.nonce
            ));
            header.push_str(&format!(
                ", qop=auth, nc=00000001, cnonce=\"{cnonce}\""
            ));
            response
        } else {
            md5_hex(format!("{ha1}:{}:{ha2}", self.nonce))
        };

        header.push_str(&format!(", response=\"{response}\""));
        if let Some(opaque) = &self.opaque {
            header.push_str(&format!(", opaque=\"{opaque}\""));
        }
        if let Some(algorithm) = &self.algorithm {
            header.push_str(&format!(", algorithm={algorithm}"));
        }
        header
    }
}

fn md5_hex(input: impl AsRef<[u8]>) -> String {
    format!("{:x}", md5::compute(input))
}

/// Parses the comma-separated `key=value` / `key="value"` list of an auth
/// challenge.
fn parse_params(input: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let mut rest = input.trim_start();

    while !rest.is_empty() {
        let Some(eq) = rest.find('=') else { break };
        let key = rest[..eq].trim().to_ascii_lowercase();
        rest = rest[eq + 1..].trim_start();

        let value = if let Some(quoted) = rest.strip_prefix('"') {
            let Some(close) = quoted.find('"') else { break };
            let value = quoted[..close].to_string();
            rest = quoted[close + 1..].trim_start();
            value
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            let value = rest[..end].trim().to_string();
            rest = &rest[end..];
            value
        };

        rest = rest.trim_start().strip_prefix(',').unwrap_or(rest).trim_start();
        params.push((key, value));
    }

    params
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHALLENGE: &str = "Digest realm=\"testrealm@host.com\", qop=\"auth,auth-int\", \
                             nonce=\"dcd98b7102dd2f0e8b11d0f600bfb0c093\", \
                             opaque=\"5ccc069c403ebaf9f0171e9517f40e41\"";

    #[test]
    fn parses_a_standard_challenge() {
        let challenge = DigestChallenge::parse(CHALLENGE).unwrap();
        assert_eq!(challenge.realm, "testrealm@host.com");
        assert_eq!(challenge.nonce, "dcd98b7102dd2f0e8b11d0f600bfb0c093");
        assert_eq!(
            challenge.opaque.as_deref(),
            Some("5ccc069c403ebaf9f0171e9517f40e41")
        );
        assert_eq!(challenge.qop.as_deref(), Some("auth,auth-int"));
    }

    #[test]
    fn rejects_other_schemes() {
        assert!(DigestChallenge::parse("Basic realm=\"files\"").is_none());
        assert!(DigestChallenge::parse("Digest nonce=\"x\"").is_none());
    }

    #[test]
    fn computes_the_rfc2617_example_response() {
        let challenge = DigestChallenge::parse(CHALLENGE).unwrap();
        let header = challenge.respond_with(
            "Mufasa",
            "Circle Of Life",
            "GET",
            "/dir/index.html",
            "0a4f113b",
        );
        assert!(
            header.contains("response=\"6629fae49393a05397450978507c4ef1\""),
            "got {header}"
        );
        assert!(header.contains("username=\"Mufasa\""));
        assert!(header.contains("uri=\"/dir/index.html\""));
        assert!(header.contains("qop=auth"));
        assert!(header.contains("opaque=\"5ccc069c403ebaf9f0171e9517f40e41\""));
    }

    #[test]
    fn responds_without_qop_when_absent() {
        let challenge = DigestChallenge::parse(
            "Digest realm=\"files\", nonce=\"abc123\"",
        )
        .unwrap();
        let header = challenge.respond_with("user", "secret", "GET", "/data.bin", "ignored");
        assert!(!header.contains("qop="));
        assert!(!header.contains("cnonce"));
        // MD5(MD5(user:files:secret):abc123:MD5(GET:/data.bin))
        let ha1 = md5_hex("user:files:secret");
        let ha2 = md5_hex("GET:/data.bin");
        let expected = md5_hex(format!("{ha1}:abc123:{ha2}"));
        assert!(header.contains(&format!("response=\"{expected}\"")));
    }

    #[test]
    fn unquoted_params_are_accepted() {
        let challenge =
            DigestChallenge::parse("Digest realm=files, nonce=abc, algorithm=MD5").unwrap();
        assert_eq!(challenge.realm, "files");
        assert_eq!(challenge.algorithm.as_deref(), Some("MD5"));
    }
}

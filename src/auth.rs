//! HTTP authentication: challenge parsing and Authorization values.
//!
//! Digest (RFC 7616, MD5 with qop=auth) is preferred over Basic whenever the
//! server offers both.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use md5::{Digest, Md5};
use std::collections::HashMap;

/// One authentication challenge from a 401/407 response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub scheme: String,
    pub params: HashMap<String, String>,
}

impl Challenge {
    pub fn realm(&self) -> &str {
        self.params.get("realm").map(String::as_str).unwrap_or("")
    }
}

/// Parse all challenges from `WWW-Authenticate` / `Proxy-Authenticate`
/// header values. Each header value may itself carry one challenge; a
/// response may carry several headers.
pub fn parse_challenges(values: &[String]) -> Vec<Challenge> {
    values.iter().filter_map(|v| parse_challenge(v)).collect()
}

fn parse_challenge(value: &str) -> Option<Challenge> {
    let value = value.trim();
    let (scheme, rest) = match value.find(char::is_whitespace) {
        Some(pos) => (&value[..pos], value[pos..].trim_start()),
        None => (value, ""),
    };
    if scheme.is_empty() {
        return None;
    }

    let mut params = HashMap::new();
    for piece in split_params(rest) {
        if let Some((key, val)) = piece.split_once('=') {
            let val = val.trim().trim_matches('"');
            params.insert(key.trim().to_ascii_lowercase(), val.to_string());
        }
    }

    Some(Challenge {
        scheme: scheme.to_ascii_lowercase(),
        params,
    })
}

/// Split `k1="a,b", k2=c` on commas outside quotes.
fn split_params(s: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for c in s.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            ',' if !in_quotes => {
                if !current.trim().is_empty() {
                    out.push(current.trim().to_string());
                }
                current.clear();
            }
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        out.push(current.trim().to_string());
    }
    out
}

/// Pick the strongest supported challenge: Digest over Basic.
pub fn select_challenge(challenges: &[Challenge]) -> Option<&Challenge> {
    challenges
        .iter()
        .find(|c| c.scheme == "digest")
        .or_else(|| challenges.iter().find(|c| c.scheme == "basic"))
}

/// Build the Authorization (or Proxy-Authorization) header value for the
/// selected challenge.
pub fn authorization_value(
    challenge: &Challenge,
    username: &str,
    password: &str,
    method: &str,
    uri_path: &str,
) -> Option<String> {
    match challenge.scheme.as_str() {
        "basic" => Some(format!(
            "Basic {}",
            BASE64.encode(format!("{}:{}", username, password))
        )),
        "digest" => digest_value(challenge, username, password, method, uri_path),
        _ => None,
    }
}

fn md5_hex(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

fn digest_value(
    challenge: &Challenge,
    username: &str,
    password: &str,
    method: &str,
    uri_path: &str,
) -> Option<String> {
    let realm = challenge.realm();
    let nonce = challenge.params.get("nonce")?;
    let opaque = challenge.params.get("opaque");
    let qop = challenge
        .params
        .get("qop")
        .map(|q| q.split(',').any(|v| v.trim() == "auth"))
        .unwrap_or(false);

    let ha1 = md5_hex(&format!("{}:{}:{}", username, realm, password));
    let ha2 = md5_hex(&format!("{}:{}", method, uri_path));

    let mut value;
    if qop {
        let cnonce: String = {
            use rand::Rng;
            let mut rng = rand::thread_rng();
            (0..16)
                .map(|_| format!("{:x}", rng.gen_range(0..16)))
                .collect()
        };
        let nc = "00000001";
        let response = md5_hex(&format!(
            "{}:{}:{}:{}:auth:{}",
            ha1, nonce, nc, cnonce, ha2
        ));
        value = format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", qop=auth, nc={}, cnonce=\"{}\", response=\"{}\"",
            username, realm, nonce, uri_path, nc, cnonce, response
        );
    } else {
        let response = md5_hex(&format!("{}:{}:{}", ha1, nonce, ha2));
        value = format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\"",
            username, realm, nonce, uri_path, response
        );
    }

    if let Some(opaque) = opaque {
        value.push_str(&format!(", opaque=\"{}\"", opaque));
    }

    Some(value)
}

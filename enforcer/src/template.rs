//! Target-URL templates.
//!
//! Identity and authorization targets are configured as URL templates
//! with `<var>` tags: `<ip>`, `<iface>`, `<mac>`, `<me>` (URL-encoded
//! on substitution) and `<ip-host>` (not encoded; IPv6 literals are
//! bracketed). Callers must rewrite the first `://<ip>` to
//! `://<ip-host>` before parsing so IPv6 literals form valid URLs.

use std::net::IpAddr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("unterminated tag in template: {0}")]
    Unterminated(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Tag(String),
}

/// A pre-parsed URL template.
#[derive(Debug, Clone)]
pub struct Template {
    segments: Vec<Segment>,
}

/// Values substituted into a template for one device.
pub struct TemplateVars<'a> {
    pub ip: IpAddr,
    pub iface: &'a str,
    pub mac: &'a str,
    pub me: &'a str,
}

impl Template {
    /// Rewrite the first `://<ip>` to `://<ip-host>`, so address
    /// literals placed in the URL host position are bracketed for
    /// IPv6.
    pub fn host_rewrite(raw: &str) -> String {
        raw.replacen("://<ip>", "://<ip-host>", 1)
    }

    pub fn parse(raw: &str) -> Result<Template, TemplateError> {
        let mut segments = Vec::new();
        let mut rest = raw;

        while let Some(open) = rest.find('<') {
            if open > 0 {
                segments.push(Segment::Literal(rest[..open].to_string()));
            }
            let after = &rest[open + 1..];
            let close = after
                .find('>')
                .ok_or_else(|| TemplateError::Unterminated(raw.to_string()))?;
            segments.push(Segment::Tag(after[..close].to_string()));
            rest = &after[close + 1..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }

        Ok(Template { segments })
    }

    /// Substitute the variables into the template.
    pub fn compile(&self, vars: &TemplateVars<'_>) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(lit) => out.push_str(lit),
                Segment::Tag(tag) => match tag.as_str() {
                    "ip" => out.push_str(&query_escape(&vars.ip.to_string())),
                    "iface" => out.push_str(&query_escape(vars.iface)),
                    "mac" => out.push_str(&query_escape(vars.mac)),
                    "me" => out.push_str(&query_escape(vars.me)),
                    "ip-host" => out.push_str(&ip_host(vars.ip)),
                    _ => {} // unknown tags expand empty
                },
            }
        }
        out
    }
}

/// The address as a URL host: IPv6 literals get brackets.
fn ip_host(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("[{v6}]"),
    }
}

fn query_escape(val: &str) -> String {
    url::form_urlencoded::byte_serialize(val.as_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(ip: &str) -> TemplateVars<'static> {
        TemplateVars {
            ip: ip.parse().unwrap(),
            iface: "eth0",
            mac: "aa:bb:cc:dd:ee:ff",
            me: "switch-1",
        }
    }

    #[test]
    fn test_default_identity_template() {
        let raw = Template::host_rewrite("http://<ip>/.autopolicy/identity.json");
        let t = Template::parse(&raw).unwrap();
        assert_eq!(
            t.compile(&vars("192.168.1.10")),
            "http://192.168.1.10/.autopolicy/identity.json"
        );
    }

    #[test]
    fn test_ipv6_host_is_bracketed() {
        let raw = Template::host_rewrite("http://<ip>/.autopolicy/identity.json");
        let t = Template::parse(&raw).unwrap();
        assert_eq!(
            t.compile(&vars("2001:db8::10")),
            "http://[2001:db8::10]/.autopolicy/identity.json"
        );
    }

    #[test]
    fn test_variables_are_query_escaped() {
        let t = Template::parse("http://decider/v1/authorize?mac=<mac>&me=<me>").unwrap();
        let mut v = vars("10.0.0.1");
        v.me = "host name";
        assert_eq!(
            t.compile(&v),
            "http://decider/v1/authorize?mac=aa%3Abb%3Acc%3Add%3Aee%3Aff&me=host+name"
        );
    }

    #[test]
    fn test_ip_tag_outside_host_is_escaped() {
        // only the host position is rewritten; later <ip> tags keep
        // URL encoding
        let raw = Template::host_rewrite("http://<ip>/q?ip=<ip>");
        let t = Template::parse(&raw).unwrap();
        assert_eq!(
            t.compile(&vars("2001:db8::10")),
            "http://[2001:db8::10]/q?ip=2001%3Adb8%3A%3A10"
        );
    }

    #[test]
    fn test_unknown_tag_expands_empty() {
        let t = Template::parse("x<bogus>y").unwrap();
        assert_eq!(t.compile(&vars("10.0.0.1")), "xy");
    }

    #[test]
    fn test_unterminated_tag_is_error() {
        assert!(Template::parse("http://<ip").is_err());
    }
}

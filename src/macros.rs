//! The RFC 7208 Section 7 macro language used inside domain-spec and exp
//! strings.
//!
//! Three expansion flavors share one scanner: live evaluation, `exp=` text
//! (which additionally admits `c`, `r` and `t`), and partial expansion for
//! static analysis, where every macro except `%{d}` is echoed back
//! unexpanded.

use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::SpfError;

/// Values the macro letters draw from. One per evaluation frame.
#[derive(Debug, Clone)]
pub struct MacroContext<'a> {
    /// MAIL FROM or HELO identity, as given.
    pub sender: &'a str,
    /// Domain currently being evaluated (changes across include/redirect).
    pub domain: &'a str,
    /// Connected client address.
    pub ip: IpAddr,
    /// HELO/EHLO identity, for `%{h}`.
    pub helo_domain: &'a str,
    /// Verifier host name, for `%{r}` (exp only).
    pub receiving_fqdn: &'a str,
    /// Timestamp for `%{t}` (exp only).
    pub evaluated_on: SystemTime,
}

/// Result of a macro expansion: the text plus the letters whose source
/// values were empty. Missing values become a validation error on
/// `include`/`exists`/`redirect` so walker-mode analysis can see them.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Expansion {
    pub text: String,
    pub missing: Vec<String>,
}

/// The `p` macro is deliberately unsupported (RFC 7208 discourages it);
/// it always produces this text.
const PTR_MACRO_VALUE: &str = "";

/// Expand `input` against `ctx`. `exp` admits the `c`/`r`/`t` letters;
/// `partial` echoes every macro but `%{d}` back unexpanded (static
/// analysis only; `exp` and `partial` are never combined by the engine).
pub fn expand(
    input: &str,
    ctx: &MacroContext<'_>,
    exp: bool,
    partial: bool,
) -> Result<Expansion, SpfError> {
    Expander {
        input,
        ctx,
        exp,
        partial,
        out: String::with_capacity(input.len()),
        missing: Vec::new(),
    }
    .run()
}

struct Expander<'a> {
    input: &'a str,
    ctx: &'a MacroContext<'a>,
    exp: bool,
    partial: bool,
    out: String,
    missing: Vec<String>,
}

impl Expander<'_> {
    fn run(mut self) -> Result<Expansion, SpfError> {
        let mut rest = self.input;
        loop {
            match rest.find('%') {
                None => {
                    self.out.push_str(rest);
                    break;
                }
                Some(pos) => {
                    self.out.push_str(&rest[..pos]);
                    rest = self.scan_percent(&rest[pos..])?;
                }
            }
        }
        Ok(Expansion {
            text: self.out,
            missing: self.missing,
        })
    }

    /// `rest` starts at a `%`. Returns the remainder after the escape or
    /// macro body.
    fn scan_percent<'b>(&mut self, rest: &'b str) -> Result<&'b str, SpfError> {
        let mut chars = rest.char_indices();
        chars.next(); // the %
        let (_, c) = chars
            .next()
            .ok_or_else(|| SpfError::MacroSyntax(format!("unexpected eof ({})", self.input)))?;
        match c {
            '{' => self.scan_macro(rest),
            '%' => {
                self.out.push_str(if self.partial { "%%" } else { "%" });
                Ok(&rest[2..])
            }
            '_' => {
                self.out.push_str(if self.partial { "%_" } else { " " });
                Ok(&rest[2..])
            }
            '-' => {
                self.out.push_str(if self.partial { "%-" } else { "%20" });
                Ok(&rest[2..])
            }
            other => Err(SpfError::MacroSyntax(format!(
                "forbidden character ({other}) after %"
            ))),
        }
    }

    /// `rest` starts at `%{`. Consumes through the closing brace.
    fn scan_macro<'b>(&mut self, rest: &'b str) -> Result<&'b str, SpfError> {
        let close = rest.find('}').ok_or_else(|| {
            SpfError::MacroSyntax(format!("unexpected eof ({})", self.input))
        })?;
        let raw = &rest[..close + 1];
        let body = &rest[2..close];
        let mut chars = body.chars();
        let letter = chars
            .next()
            .ok_or_else(|| SpfError::MacroSyntax("empty macro body".to_string()))?;
        let tail: &str = chars.as_str();

        if self.partial {
            self.expand_partial(letter, tail, raw)?;
        } else {
            self.expand_live(letter, tail)?;
        }
        Ok(&rest[close + 1..])
    }

    fn expand_partial(&mut self, letter: char, tail: &str, raw: &str) -> Result<(), SpfError> {
        match letter.to_ascii_lowercase() {
            's' | 'l' | 'o' | 'h' | 'i' | 'c' | 'r' | 't' => {
                // Validate the body shape, keep the macro itself.
                parse_transformers(tail)?;
                self.out.push_str(raw);
            }
            'd' => {
                let tf = parse_transformers(tail)?;
                let result = tf.apply(remove_root(self.ctx.domain));
                if result.is_empty() {
                    self.out.push_str(raw);
                } else {
                    self.out.push_str(&result);
                }
            }
            _ => {
                // p, v, and anything unknown: bare bodies only.
                if !tail.is_empty() {
                    return Err(SpfError::MacroSyntax(format!(
                        "unexpected char ({}), expected '}}'",
                        tail.chars().next().unwrap()
                    )));
                }
                self.out.push_str(raw);
            }
        }
        Ok(())
    }

    fn expand_live(&mut self, letter: char, tail: &str) -> Result<(), SpfError> {
        let exp_only = |allowed: bool, l: char| {
            if allowed {
                Ok(())
            } else {
                Err(SpfError::MacroSyntax(format!(
                    "'{l}' macro letter allowed only in \"exp\" text"
                )))
            }
        };

        // Letters without transformer support expect the brace right away.
        let bare = |tail: &str| {
            if tail.is_empty() {
                Ok(())
            } else {
                Err(SpfError::MacroSyntax(format!(
                    "unexpected char ({}), expected '}}'",
                    tail.chars().next().unwrap()
                )))
            }
        };

        let (value, missing_name): (String, Option<&str>) = match letter.to_ascii_lowercase() {
            's' => (self.ctx.sender.to_string(), Some("sender {s}")),
            'l' => (
                parse_addr_spec(self.ctx.sender).local,
                Some("local-part of <sender> {l}"),
            ),
            'o' => (
                remove_root(&parse_addr_spec(self.ctx.sender).domain).to_string(),
                Some("domain of <sender> {o}"),
            ),
            'h' => (
                remove_root(self.ctx.helo_domain).to_string(),
                Some("heloDomain {h}"),
            ),
            'd' => (remove_root(self.ctx.domain).to_string(), Some("domain {d}")),
            'i' => (to_dotted_hex(self.ctx.ip), Some("ip {i}")),
            'p' => {
                bare(tail)?;
                self.out.push_str(PTR_MACRO_VALUE);
                return Ok(());
            }
            'v' => {
                bare(tail)?;
                self.out.push_str(match self.ctx.ip {
                    IpAddr::V4(_) => "in-addr",
                    IpAddr::V6(_) => "ip6",
                });
                return Ok(());
            }
            'c' => {
                exp_only(self.exp, 'c')?;
                (self.ctx.ip.to_string(), Some("SMTP client IP {c}"))
            }
            'r' => {
                exp_only(self.exp, 'r')?;
                (
                    self.ctx.receiving_fqdn.to_string(),
                    Some("receivingDomain {r}"),
                )
            }
            't' => {
                exp_only(self.exp, 't')?;
                let secs = self
                    .ctx
                    .evaluated_on
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs().to_string())
                    .unwrap_or_else(|_| "0".to_string());
                (secs, Some("current timestamp {t}"))
            }
            _ => {
                // Unknown letters expand to nothing, matching the
                // reference behavior; only unknown modifiers get the
                // strict ABNF treatment, in the lexer.
                bare(tail)?;
                return Ok(());
            }
        };

        let tf = parse_transformers(tail)?;
        let result = tf.apply(&value);
        if result.is_empty() {
            if let Some(name) = missing_name {
                self.missing.push(name.to_string());
            }
        }
        self.out.push_str(&result);
        Ok(())
    }
}

/// Transformers after the macro letter: `*DIGIT ["r"] [delimiter]`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Transformers {
    cardinality: Option<usize>,
    reversed: bool,
    delimiter: Option<char>,
}

impl Transformers {
    fn apply(&self, value: &str) -> String {
        if self.cardinality.is_none() && !self.reversed && self.delimiter.is_none() {
            return value.to_string();
        }
        let delim = self.delimiter.unwrap_or('.');
        let mut parts: Vec<&str> = value.split(delim).collect();
        if self.reversed {
            parts.reverse();
        }
        let keep = self
            .cardinality
            .unwrap_or(parts.len())
            .min(parts.len());
        parts[parts.len() - keep..].join(".")
    }
}

fn is_macro_delimiter(c: char) -> bool {
    matches!(c, '.' | '-' | '+' | ',' | '/' | '_' | '=')
}

fn parse_transformers(tail: &str) -> Result<Transformers, SpfError> {
    let mut tf = Transformers::default();
    let mut chars = tail.chars().peekable();

    let mut digits = String::new();
    while let Some(&c) = chars.peek() {
        if c.is_ascii_digit() {
            digits.push(c);
            chars.next();
        } else {
            break;
        }
    }
    if !digits.is_empty() {
        tf.cardinality = Some(
            digits
                .parse()
                .map_err(|_| SpfError::MacroSyntax(format!("bad cardinality: {digits}")))?,
        );
    }

    if matches!(chars.peek(), Some('r') | Some('R')) {
        tf.reversed = true;
        chars.next();
    }

    if let Some(&c) = chars.peek() {
        if is_macro_delimiter(c) {
            tf.delimiter = Some(c);
            chars.next();
        }
    }

    if let Some(c) = chars.next() {
        return Err(SpfError::MacroSyntax(format!(
            "unexpected char ({c}), expected '}}'"
        )));
    }
    Ok(tf)
}

/// `local@domain` split of the sender identity. An absent or empty
/// local-part becomes `postmaster` per RFC 7208 Section 7.3.
pub(crate) struct AddrSpec {
    pub local: String,
    pub domain: String,
}

pub(crate) fn parse_addr_spec(sender: &str) -> AddrSpec {
    match sender.rsplit_once('@') {
        Some((local, domain)) => AddrSpec {
            local: if local.is_empty() {
                "postmaster".to_string()
            } else {
                local.to_string()
            },
            domain: domain.to_string(),
        },
        None => AddrSpec {
            local: "postmaster".to_string(),
            domain: sender.to_string(),
        },
    }
}

fn remove_root(d: &str) -> &str {
    d.strip_suffix('.').unwrap_or(d)
}

/// `%{i}`: dotted-quad for IPv4; for IPv6, sixteen groups of 1-2 lowercase
/// hex digits, one per byte, high nibble first, leading zeros omitted.
fn to_dotted_hex(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => {
            let mut out = String::with_capacity(47);
            for (i, b) in v6.octets().iter().enumerate() {
                if i > 0 {
                    out.push('.');
                }
                out.push_str(&format!("{b:x}"));
            }
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn rfc_ctx() -> MacroContext<'static> {
        MacroContext {
            sender: "strong-bad@email.example.com",
            domain: "email.example.com",
            ip: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 3)),
            helo_domain: "mta.example.com",
            receiving_fqdn: "rx.example.org",
            evaluated_on: UNIX_EPOCH + std::time::Duration::from_secs(1_234_567_890),
        }
    }

    fn live(input: &str) -> String {
        expand(input, &rfc_ctx(), false, false).unwrap().text
    }

    // The sample set from RFC 7208 Section 7.4.
    #[test]
    fn rfc_samples() {
        assert_eq!(live("%{s}"), "strong-bad@email.example.com");
        assert_eq!(live("%{o}"), "email.example.com");
        assert_eq!(live("%{d}"), "email.example.com");
        assert_eq!(live("%{d4}"), "email.example.com");
        assert_eq!(live("%{d1}"), "com");
        assert_eq!(live("%{dr}"), "com.example.email");
        assert_eq!(live("%{d2r}"), "example.email");
        assert_eq!(live("%{l}"), "strong-bad");
        assert_eq!(live("%{l-}"), "strong.bad");
        assert_eq!(live("%{lr}"), "strong-bad");
        assert_eq!(live("%{lr-}"), "bad.strong");
        assert_eq!(live("%{l1r-}"), "strong");
    }

    #[test]
    fn rfc_composed_samples() {
        assert_eq!(
            live("%{ir}.%{v}._spf.%{d2}"),
            "3.2.0.192.in-addr._spf.example.com"
        );
        assert_eq!(
            live("%{lr-}.lp._spf.%{d2}"),
            "bad.strong.lp._spf.example.com"
        );
        assert_eq!(
            live("%{ir}.%{v}.%{l1r-}.lp._spf.%{d2}"),
            "3.2.0.192.in-addr.strong.lp._spf.example.com"
        );
    }

    #[test]
    fn dotted_hex_v6() {
        let ctx = MacroContext {
            ip: "1000::ff".parse::<Ipv6Addr>().unwrap().into(),
            ..rfc_ctx()
        };
        assert_eq!(
            expand("%{i}", &ctx, false, false).unwrap().text,
            "10.0.0.0.0.0.0.0.0.0.0.0.0.0.0.ff"
        );
        assert_eq!(
            expand("%{v}", &ctx, false, false).unwrap().text,
            "ip6"
        );
    }

    #[test]
    fn escapes() {
        assert_eq!(live("%%"), "%");
        assert_eq!(live("%_"), " ");
        assert_eq!(live("%-"), "%20");
        assert_eq!(live("a%%b"), "a%b");
    }

    #[test]
    fn forbidden_after_percent() {
        assert!(expand("%x", &rfc_ctx(), false, false).is_err());
        assert!(expand("trailing%", &rfc_ctx(), false, false).is_err());
    }

    #[test]
    fn unterminated_macro() {
        assert!(expand("%{d", &rfc_ctx(), false, false).is_err());
    }

    #[test]
    fn exp_letters_guarded() {
        let ctx = rfc_ctx();
        for m in ["%{c}", "%{r}", "%{t}"] {
            assert!(expand(m, &ctx, false, false).is_err(), "{m}");
            assert!(expand(m, &ctx, true, false).is_ok(), "{m}");
        }
        assert_eq!(expand("%{c}", &ctx, true, false).unwrap().text, "192.0.2.3");
        assert_eq!(
            expand("%{r}", &ctx, true, false).unwrap().text,
            "rx.example.org"
        );
        assert_eq!(
            expand("%{t}", &ctx, true, false).unwrap().text,
            "1234567890"
        );
    }

    #[test]
    fn p_macro_is_empty() {
        assert_eq!(live("a.%{p}.b"), "a..b");
        // No transformers allowed on p.
        assert!(expand("%{p2}", &rfc_ctx(), false, false).is_err());
    }

    #[test]
    fn cardinality_clamps() {
        assert_eq!(live("%{d9}"), "email.example.com");
    }

    #[test]
    fn missing_values_are_collected() {
        let ctx = MacroContext {
            sender: "",
            helo_domain: "",
            ..rfc_ctx()
        };
        let e = expand("%{s}.%{h}", &ctx, false, false).unwrap();
        assert_eq!(e.text, ".");
        assert_eq!(
            e.missing,
            vec!["sender {s}".to_string(), "heloDomain {h}".to_string()]
        );
    }

    #[test]
    fn empty_local_part_becomes_postmaster() {
        let ctx = MacroContext {
            sender: "@example.com",
            ..rfc_ctx()
        };
        assert_eq!(expand("%{l}", &ctx, false, false).unwrap().text, "postmaster");
    }

    #[test]
    fn literal_preservation_is_idempotent() {
        let ctx = rfc_ctx();
        let s = "no-macros.example.com";
        let once = expand(s, &ctx, false, false).unwrap().text;
        assert_eq!(once, s);
        let twice = expand(&once, &ctx, false, false).unwrap().text;
        assert_eq!(twice, once);
    }

    #[test]
    fn partial_keeps_macros_except_d() {
        let ctx = rfc_ctx();
        let e = expand("%{l}._x.%{d2}", &ctx, false, true).unwrap();
        assert_eq!(e.text, "%{l}._x.example.com");
    }

    #[test]
    fn partial_keeps_escapes_verbatim() {
        let ctx = rfc_ctx();
        let e = expand("%%x%_y%-", &ctx, false, true).unwrap();
        assert_eq!(e.text, "%%x%_y%-");
    }

    #[test]
    fn partial_still_validates_body() {
        let ctx = rfc_ctx();
        assert!(expand("%{l$}", &ctx, false, true).is_err());
    }

    #[test]
    fn unknown_letter_expands_empty() {
        assert_eq!(live("%{x}"), "");
        assert!(expand("%{x2r}", &rfc_ctx(), false, false).is_err());
    }
}

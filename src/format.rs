//! Print-sink format templates
//!
//! A printf-like mini-language: `%[-0#][width][.precision]<token>` plus the
//! backslash escapes `\n`, `\t` and `\\`. Unknown tokens are copied through.
//!
//! Developed by GoCortex.io

use async_snmp::Oid;
use chrono::{DateTime, Datelike, Local, Timelike};
use std::fmt;

use crate::render::{uptime_string, SnmpText};
use crate::trap::TrapEvent;

pub const DEFAULT_LEGACY_FORMAT: &str =
    "%.4y-%.2m-%.2l %.2h:%.2j:%.2k %B [%b] (via %A [%a]): %N\n\t%W Trap (%q) Uptime: %#T\n%v\n";

pub const DEFAULT_NOTIFICATION_FORMAT: &str = "%.4y-%.2m-%.2l %.2h:%.2j:%.2k %B [%b]:\n%v\n";

#[derive(Debug, Default, Clone, Copy)]
struct Spec {
    left: bool,
    zero: bool,
    alternate: bool,
    width: usize,
    precision: Option<usize>,
}

enum Field {
    Number(i64),
    Text(String),
}

/// Render `template` for one event into `out`.
///
/// `trap_oid` is the normalized trap identity, used by `%N` for notifications.
pub fn render(
    template: &str,
    event: &TrapEvent,
    trap_oid: Option<&Oid>,
    out: &mut impl fmt::Write,
) -> fmt::Result {
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some('n') => out.write_char('\n')?,
                Some('t') => out.write_char('\t')?,
                Some('\\') => out.write_char('\\')?,
                Some(other) => {
                    out.write_char('\\')?;
                    out.write_char(other)?;
                }
                None => out.write_char('\\')?,
            },
            '%' => {
                let mut spec = Spec::default();
                while let Some(&flag) = chars.peek() {
                    match flag {
                        '-' => spec.left = true,
                        '0' => spec.zero = true,
                        '#' => spec.alternate = true,
                        _ => break,
                    }
                    chars.next();
                }
                spec.width = read_number(&mut chars).unwrap_or(0);
                if chars.peek() == Some(&'.') {
                    chars.next();
                    spec.precision = Some(read_number(&mut chars).unwrap_or(0));
                }

                match chars.next() {
                    Some('%') => out.write_char('%')?,
                    Some(token) => match field(token, &spec, event, trap_oid) {
                        Some(value) => write_field(out, &spec, value)?,
                        None => {
                            out.write_char('%')?;
                            out.write_char(token)?;
                        }
                    },
                    None => out.write_char('%')?,
                }
            }
            other => out.write_char(other)?,
        }
    }
    Ok(())
}

fn read_number(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> Option<usize> {
    let mut value: Option<usize> = None;
    while let Some(digit) = chars.peek().and_then(|c| c.to_digit(10)) {
        value = Some(value.unwrap_or(0).saturating_mul(10).saturating_add(digit as usize));
        chars.next();
    }
    value
}

fn boot_time(event: &TrapEvent) -> DateTime<Local> {
    event.received_at - chrono::Duration::milliseconds(i64::from(event.sys_uptime) * 10)
}

fn date_field(token: char, time: &DateTime<Local>) -> Option<Field> {
    let value = match token.to_ascii_lowercase() {
        'y' => i64::from(time.year()),
        'm' => i64::from(time.month()),
        'l' => i64::from(time.day()),
        'h' => i64::from(time.hour()),
        'j' => i64::from(time.minute()),
        'k' => i64::from(time.second()),
        _ => return None,
    };
    Some(Field::Number(value))
}

fn field(token: char, spec: &Spec, event: &TrapEvent, trap_oid: Option<&Oid>) -> Option<Field> {
    let field = match token {
        'y' | 'm' | 'l' | 'h' | 'j' | 'k' => return date_field(token, &event.received_at),
        'Y' | 'M' | 'L' | 'H' | 'J' | 'K' => return date_field(token, &boot_time(event)),
        't' => Field::Number(event.received_at.timestamp()),
        'T' if spec.alternate => Field::Text(uptime_string(event.sys_uptime)),
        'T' => Field::Number(i64::from(event.sys_uptime / 100)),
        'a' => Field::Text(event.agent_ip().to_string()),
        'A' => Field::Text(event.agent_host_or_ip()),
        'b' => Field::Text(event.source_ip().to_string()),
        'B' => Field::Text(event.host_or_ip()),
        'N' => Field::Text(match (&event.legacy, trap_oid) {
            (Some(legacy), _) => legacy.enterprise.to_string(),
            (None, Some(oid)) => oid.to_string(),
            (None, None) => String::new(),
        }),
        'w' => match &event.legacy {
            Some(legacy) => Field::Number(i64::from(legacy.generic)),
            None => Field::Text(String::new()),
        },
        'W' => Field::Text(
            event
                .legacy
                .as_ref()
                .map(|legacy| legacy.description().to_string())
                .unwrap_or_default(),
        ),
        'q' => match &event.legacy {
            Some(legacy) => Field::Number(i64::from(legacy.specific)),
            None => Field::Text(String::new()),
        },
        'P' => Field::Text(event.community_str()),
        'v' => {
            let mut text = String::new();
            for (i, vb) in event.variables.iter().enumerate() {
                if i > 0 {
                    text.push('\t');
                }
                vb.write_full(&mut text).ok()?;
            }
            Field::Text(text)
        }
        _ => return None,
    };
    Some(field)
}

fn write_field(out: &mut impl fmt::Write, spec: &Spec, value: Field) -> fmt::Result {
    match value {
        Field::Number(n) => {
            let mut digits = n.unsigned_abs().to_string();
            if let Some(precision) = spec.precision {
                while digits.len() < precision {
                    digits.insert(0, '0');
                }
            }
            let sign = if n < 0 { "-" } else { "" };
            let len = sign.len() + digits.len();
            let pad = spec.width.saturating_sub(len);

            if spec.left {
                write!(out, "{}{}{:pad$}", sign, digits, "", pad = pad)
            } else if spec.zero && spec.precision.is_none() {
                write!(out, "{}{}{}", sign, "0".repeat(pad), digits)
            } else {
                write!(out, "{:pad$}{}{}", "", sign, digits, pad = pad)
            }
        }
        Field::Text(text) => {
            let text: &str = match spec.precision {
                Some(max) => match text.char_indices().nth(max) {
                    Some((end, _)) => &text[..end],
                    None => &text,
                },
                None => &text,
            };
            let pad = spec.width.saturating_sub(text.chars().count());
            if spec.left {
                write!(out, "{}{:pad$}", text, "", pad = pad)
            } else {
                write!(out, "{:pad$}{}", "", text, pad = pad)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{well_known, Message, PduBody};
    use crate::normalize::normalize;
    use async_snmp::{Pdu, PduType, TrapV1Pdu, Value, VarBind, Version};
    use bytes::Bytes;
    use chrono::TimeZone;

    fn received_at() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 5, 7, 8, 9).single().unwrap()
    }

    fn legacy_event() -> TrapEvent {
        let msg = Message::new(
            Version::V1,
            Bytes::from_static(b"public"),
            PduBody::TrapV1(TrapV1Pdu {
                enterprise: Oid::parse("1.3.6.1.4.1.9").unwrap(),
                agent_addr: [10, 0, 0, 1],
                generic_trap: 6,
                specific_trap: 7,
                time_stamp: 1234,
                varbinds: vec![VarBind::new(
                    Oid::parse("1.3.6.1.2.1.1.5.0").unwrap(),
                    Value::OctetString(Bytes::from_static(b"r1")),
                )],
            }),
        );
        TrapEvent::from_message(msg, "192.0.2.10:1162".parse().unwrap(), received_at()).unwrap()
    }

    fn notification_event() -> TrapEvent {
        let msg = Message::new(
            Version::V2c,
            Bytes::from_static(b"public"),
            PduBody::Standard(Pdu {
                pdu_type: PduType::TrapV2,
                request_id: 3,
                error_status: 0,
                error_index: 0,
                varbinds: vec![
                    VarBind::new(well_known::sys_uptime(), Value::TimeTicks(100)),
                    VarBind::new(
                        well_known::snmp_trap_oid(),
                        Value::ObjectIdentifier(Oid::parse("1.3.6.1.4.1.999.1").unwrap()),
                    ),
                ],
            }),
        );
        TrapEvent::from_message(msg, "192.0.2.20:1162".parse().unwrap(), received_at()).unwrap()
    }

    fn render_to_string(template: &str, event: &TrapEvent) -> String {
        let normalized = normalize(event);
        let mut out = String::new();
        render(template, event, normalized.trap_oid.as_ref(), &mut out).unwrap();
        out
    }

    #[test]
    fn test_default_legacy_format() {
        let mut event = legacy_event();
        event.resolved_host = Some("edge-1.example.net".to_string());
        event.agent_host = Some("agent-7.example.net".to_string());
        assert_eq!(
            render_to_string(DEFAULT_LEGACY_FORMAT, &event),
            "2024-03-05 07:08:09 edge-1.example.net [192.0.2.10] (via agent-7.example.net [10.0.0.1]): \
             1.3.6.1.4.1.9\n\tEnterprise Specific Trap (7) Uptime: 0:00:12.34\n\
             1.3.6.1.2.1.1.5.0 = STRING: \"r1\"\n"
        );
    }

    #[test]
    fn test_default_notification_format() {
        assert_eq!(
            render_to_string(DEFAULT_NOTIFICATION_FORMAT, &notification_event()),
            "2024-03-05 07:08:09 192.0.2.20 [192.0.2.20]:\n\
             1.3.6.1.2.1.1.3.0 = Timeticks: (100) 0:00:01.00\t\
             1.3.6.1.6.3.1.1.4.1.0 = OID: 1.3.6.1.4.1.999.1\n"
        );
    }

    #[test]
    fn test_boot_time_and_uptime_tokens() {
        let event = legacy_event();
        // 1234 ticks is 12.34s before 07:08:09
        assert_eq!(render_to_string("%.2H:%.2J:%.2K %T %#T", &event), "07:07:56 12 0:00:12.34");
    }

    #[test]
    fn test_modifiers_and_escapes() {
        let event = legacy_event();
        assert_eq!(render_to_string("[%5q][%-5q][%05q]", &event), "[    7][7    ][00007]");
        assert_eq!(render_to_string("[%.3P][%8b]", &event), "[pub][192.0.2.10]");
        assert_eq!(render_to_string("%w\\t%W\\n100%%\\\\", &event), "6\tEnterprise Specific\n100%\\");
        assert_eq!(render_to_string("%N %Z", &notification_event()), "1.3.6.1.4.1.999.1 %Z");
    }
}

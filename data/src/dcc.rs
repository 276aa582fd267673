use std::net::{IpAddr, Ipv4Addr};
use std::num::NonZeroU16;

use irc::proto;

use crate::ctcp;

/// Decodes a DCC request out of PRIVMSG text, if it is one.
pub fn decode(content: &str) -> Option<Command> {
    let query = ctcp::parse_query(content)?;

    if query.command != ctcp::Command::DCC {
        return None;
    }

    let args = tokens(query.params?);
    let mut args = args.iter().map(String::as_str);

    match args.next()?.to_uppercase().as_str() {
        "SEND" => Send::decode(args).map(Command::Send),
        "RESUME" => Transfer::decode(args).map(Command::Resume),
        "ACCEPT" => Transfer::decode(args).map(Command::Accept),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Send(Send),
    /// `DCC RESUME <filename> <port> <position>`
    Resume(Transfer),
    /// `DCC ACCEPT <filename> <port> <position>`
    Accept(Transfer),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Send {
    /// Passive (reverse) offer: zero ip/port plus a non-empty token.
    Reverse {
        filename: String,
        size: u64,
        token: String,
    },
    /// Active offer: the sender is already listening.
    Direct {
        filename: String,
        host: IpAddr,
        port: NonZeroU16,
        size: u64,
        token: Option<String>,
    },
}

impl Send {
    pub fn filename(&self) -> &str {
        match self {
            Send::Reverse { filename, .. } => filename,
            Send::Direct { filename, .. } => filename,
        }
    }

    pub fn size(&self) -> u64 {
        match self {
            Send::Reverse { size, .. } => *size,
            Send::Direct { size, .. } => *size,
        }
    }

    pub fn token(&self) -> Option<&str> {
        match self {
            Send::Reverse { token, .. } => Some(token),
            Send::Direct { token, .. } => token.as_deref(),
        }
    }

    fn decode<'a>(mut args: impl Iterator<Item = &'a str>) -> Option<Self> {
        let filename = args.next()?.to_string();
        let host = args.next()?;
        let port = args.next()?.parse::<u16>().ok()?;
        let size = args.next()?.parse().ok()?;
        let token = args.next().map(String::from);

        match NonZeroU16::new(port) {
            // A passive offer must carry a token to pair the reply
            None => Some(Self::Reverse {
                filename,
                size,
                token: token.filter(|t| !t.is_empty())?,
            }),
            Some(port) => Some(Self::Direct {
                filename,
                host: decode_host(host)?,
                port,
                size,
                token,
            }),
        }
    }

    pub fn encode(self, target: impl ToString) -> proto::Message {
        let payload = match self {
            Self::Reverse {
                filename,
                size,
                token,
            } => format!("SEND {} 0 0 {size} {token}", quote(&filename)),
            Self::Direct {
                filename,
                host,
                port,
                size,
                token,
            } => {
                let host = encode_host(host);
                let token = token.map(|t| format!(" {t}")).unwrap_or_default();

                format!("SEND {} {host} {port} {size}{token}", quote(&filename))
            }
        };

        message(target, payload)
    }
}

/// Filename/port/position triple shared by `DCC RESUME` and
/// `DCC ACCEPT`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub filename: String,
    pub port: u16,
    pub position: u64,
}

impl Transfer {
    fn decode<'a>(mut args: impl Iterator<Item = &'a str>) -> Option<Self> {
        let filename = args.next()?.to_string();
        let port = args.next()?.parse().ok()?;
        let position = args.next()?.parse().ok()?;

        Some(Self {
            filename,
            port,
            position,
        })
    }

    pub fn encode_resume(self, target: impl ToString) -> proto::Message {
        let payload = format!(
            "RESUME {} {} {}",
            quote(&self.filename),
            self.port,
            self.position
        );
        message(target, payload)
    }

    pub fn encode_accept(self, target: impl ToString) -> proto::Message {
        let payload = format!(
            "ACCEPT {} {} {}",
            quote(&self.filename),
            self.port,
            self.position
        );
        message(target, payload)
    }
}

fn message(target: impl ToString, payload: String) -> proto::Message {
    let text = ctcp::format(&ctcp::Command::DCC, Some(&payload));

    proto::command("PRIVMSG", vec![target.to_string(), text])
}

/// DCC addresses ride the wire as 32-bit big-endian integers (IPv6 as
/// the literal address text).
fn decode_host(host: &str) -> Option<IpAddr> {
    match host.parse::<u32>() {
        Ok(n) => Some(IpAddr::V4(Ipv4Addr::from(n))),
        Err(_) => host.parse().ok(),
    }
}

fn encode_host(host: IpAddr) -> String {
    match host {
        IpAddr::V4(v4) => u32::from(v4).to_string(),
        IpAddr::V6(v6) => v6.to_string(),
    }
}

fn quote(filename: &str) -> String {
    if filename.contains(' ') {
        format!("\"{filename}\"")
    } else {
        filename.to_string()
    }
}

/// Splits a CTCP payload on whitespace, honoring a double-quoted
/// filename containing spaces.
fn tokens(payload: &str) -> Vec<String> {
    let mut tokens = vec![];
    let mut rest = payload.trim();

    while !rest.is_empty() {
        if let Some(quoted) = rest.strip_prefix('"') {
            if let Some(end) = quoted.find('"') {
                tokens.push(quoted[..end].to_string());
                rest = quoted[end + 1..].trim_start();
                continue;
            }
        }

        match rest.split_once(char::is_whitespace) {
            Some((token, remainder)) => {
                tokens.push(token.to_string());
                rest = remainder.trim_start();
            }
            None => {
                tokens.push(rest.to_string());
                rest = "";
            }
        }
    }

    tokens
}

#[cfg(test)]
mod test {
    use irc::proto::Command as ProtoCommand;

    use super::*;

    fn privmsg_text(message: proto::Message) -> String {
        match message.command {
            ProtoCommand::PRIVMSG(_, text) => text,
            _ => panic!("expected PRIVMSG"),
        }
    }

    #[test]
    fn active_send_with_quoted_filename() {
        let content = "\u{1}DCC SEND \"my file name.txt\" 2130706433 1234 10240\u{1}";

        let Some(Command::Send(Send::Direct {
            filename,
            host,
            port,
            size,
            token,
        })) = decode(content)
        else {
            panic!("expected direct send");
        };

        assert_eq!(filename, "my file name.txt");
        assert_eq!(host, IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)));
        assert_eq!(port.get(), 1234);
        assert_eq!(size, 10240);
        assert_eq!(token, None);
    }

    #[test]
    fn passive_offer_round_trip() {
        let offer = Send::Reverse {
            filename: "file.bin".into(),
            size: 1024,
            token: "4211".into(),
        };

        let text = privmsg_text(offer.clone().encode("bob"));
        assert_eq!(text, "\u{1}DCC SEND file.bin 0 0 1024 4211\u{1}");

        assert_eq!(decode(&text), Some(Command::Send(offer)));
    }

    #[test]
    fn passive_offer_without_token_rejected() {
        assert_eq!(decode("\u{1}DCC SEND file.bin 0 0 1024\u{1}"), None);
    }

    #[test]
    fn direct_send_encode() {
        let send = Send::Direct {
            filename: "file.bin".into(),
            host: IpAddr::V4(Ipv4Addr::new(10, 20, 30, 41)),
            port: NonZeroU16::new(5000).unwrap(),
            size: 204800,
            token: None,
        };

        let text = privmsg_text(send.encode("bob"));
        assert_eq!(text, "\u{1}DCC SEND file.bin 169090601 5000 204800\u{1}");
    }

    #[test]
    fn resume_and_accept() {
        let transfer = Transfer {
            filename: "another.zip".into(),
            port: 5000,
            position: 102400,
        };

        let text = privmsg_text(transfer.clone().encode_resume("bob"));
        assert_eq!(text, "\u{1}DCC RESUME another.zip 5000 102400\u{1}");
        assert_eq!(decode(&text), Some(Command::Resume(transfer.clone())));

        let text = privmsg_text(transfer.clone().encode_accept("bob"));
        assert_eq!(text, "\u{1}DCC ACCEPT another.zip 5000 102400\u{1}");
        assert_eq!(decode(&text), Some(Command::Accept(transfer)));
    }
}

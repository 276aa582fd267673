use std::time::Duration;

use tokio::time::Instant;

use irc::proto::{command, Command, Message, Numeric};

use crate::store::ConnectionInfo;

pub const TIMEOUT: Duration = Duration::from_secs(30);
pub const MAX_NICK_RETRIES: u8 = 3;

/// NICK/USER exchange, with `_`-suffix retry on collision before
/// welcome.
#[derive(Debug)]
pub struct Registration {
    nick: String,
    retries: u8,
    deadline: Instant,
}

#[derive(Debug)]
pub enum Step {
    Continue(Vec<Message>),
    /// RPL_WELCOME: registration confirmed by the server.
    Registered {
        nick: String,
        server: Option<String>,
    },
    Unhandled,
}

impl Registration {
    /// Returns the handler plus the opening burst: optional `PASS`,
    /// then `NICK` and `USER`.
    pub fn start(info: &ConnectionInfo) -> (Self, Vec<Message>) {
        let mut messages = vec![];

        if let Some(password) = &info.server_password {
            messages.push(command!("PASS", password.clone()));
        }

        let username = info.username.clone().unwrap_or_else(|| info.nick.clone());
        let realname = info.realname.clone().unwrap_or_else(|| info.nick.clone());

        messages.push(command!("NICK", info.nick.clone()));
        messages.push(command!("USER", username, realname));

        (
            Self {
                nick: info.nick.clone(),
                retries: 0,
                deadline: Instant::now() + TIMEOUT,
            },
            messages,
        )
    }

    pub fn nick(&self) -> &str {
        &self.nick
    }

    pub fn timed_out(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    pub fn handle(&mut self, message: &Message) -> Result<Step, Error> {
        let Command::Numeric(numeric, params) = &message.command else {
            return Ok(Step::Unhandled);
        };

        match numeric {
            Numeric::ERR_NICKNAMEINUSE | Numeric::ERR_NICKCOLLISION => {
                if self.retries >= MAX_NICK_RETRIES {
                    return Err(Error::NickUnavailable(self.nick.clone()));
                }

                self.retries += 1;
                self.nick.push('_');

                Ok(Step::Continue(vec![command!("NICK", self.nick.clone())]))
            }
            Numeric::RPL_WELCOME => {
                // The server has the final say on our nick
                if let Some(confirmed) = params.first() {
                    self.nick = confirmed.clone();
                }

                let server = message.source.as_ref().and_then(|source| match source {
                    irc::proto::Source::Server(server) => Some(server.clone()),
                    irc::proto::Source::User(_) => None,
                });

                Ok(Step::Registered {
                    nick: self.nick.clone(),
                    server,
                })
            }
            _ => Ok(Step::Unhandled),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("nickname {0:?} and fallbacks are unavailable")]
    NickUnavailable(String),
    #[error("registration timed out")]
    Timeout,
}

#[cfg(test)]
mod test {
    use irc::proto::{format, parse};

    use super::*;
    use crate::store::ConnectionInfo;

    fn info() -> ConnectionInfo {
        ConnectionInfo {
            server: "irc.test".into(),
            port: 6667,
            use_tls: false,
            verify_tls: true,
            nick: "desirednick".into(),
            username: Some("user".into()),
            realname: Some("Real Name".into()),
            server_password: None,
            nickserv_password: None,
            sasl_username: None,
            sasl_password: None,
            channels: vec![],
            caps: vec![],
            config_errors: vec![],
        }
    }

    fn server(line: &str) -> Message {
        parse::message(&format!("{line}\r\n")).unwrap()
    }

    fn lines(messages: &[Message]) -> Vec<String> {
        messages
            .iter()
            .map(|m| format::message(m.clone()).trim_end().to_string())
            .collect()
    }

    #[test]
    fn opening_burst() {
        let (_, messages) = Registration::start(&info());
        assert_eq!(
            lines(&messages),
            vec!["NICK desirednick", "USER user 0 * :Real Name"]
        );

        let mut with_pass = info();
        with_pass.server_password = Some("hunter2".into());
        let (_, messages) = Registration::start(&with_pass);
        assert_eq!(
            lines(&messages),
            vec!["PASS hunter2", "NICK desirednick", "USER user 0 * :Real Name"]
        );
    }

    #[test]
    fn nick_collision_retries_then_welcome() {
        let (mut registration, _) = Registration::start(&info());

        let step = registration
            .handle(&server(
                ":irc.test 433 * desirednick :Nickname is already in use",
            ))
            .unwrap();
        let Step::Continue(messages) = step else {
            panic!("expected retry");
        };
        assert_eq!(lines(&messages), vec!["NICK desirednick_"]);

        let step = registration
            .handle(&server(
                ":irc.test 433 * desirednick_ :Nickname is already in use",
            ))
            .unwrap();
        let Step::Continue(messages) = step else {
            panic!("expected retry");
        };
        assert_eq!(lines(&messages), vec!["NICK desirednick__"]);

        let step = registration
            .handle(&server(":irc.test 001 desirednick__ :Welcome home"))
            .unwrap();
        let Step::Registered { nick, server } = step else {
            panic!("expected welcome");
        };
        assert_eq!(nick, "desirednick__");
        assert_eq!(server.as_deref(), Some("irc.test"));
    }

    #[test]
    fn gives_up_after_max_retries() {
        let (mut registration, _) = Registration::start(&info());

        for _ in 0..MAX_NICK_RETRIES {
            registration
                .handle(&server(":irc.test 433 * x :in use"))
                .unwrap();
        }

        assert!(matches!(
            registration.handle(&server(":irc.test 436 * x :collision")),
            Err(Error::NickUnavailable(_))
        ));
    }
}

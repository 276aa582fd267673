use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::time::Instant;

use irc::proto::{command, Command, Message, Numeric};

pub const STEP_TIMEOUT: Duration = Duration::from_secs(10);

/// SASL PLAIN, the only mechanism spoken.
#[derive(Debug)]
pub struct Authentication {
    username: String,
    password: String,
    state: State,
    step_deadline: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitingChallenge,
    AwaitingResult,
    Done,
}

#[derive(Debug)]
pub enum Step {
    Continue(Vec<Message>),
    Success,
    Unhandled,
}

impl Authentication {
    /// Returns the flow and the opening `AUTHENTICATE PLAIN`.
    pub fn start(username: String, password: String) -> (Self, Message) {
        (
            Self {
                username,
                password,
                state: State::AwaitingChallenge,
                step_deadline: Instant::now() + STEP_TIMEOUT,
            },
            command!("AUTHENTICATE", "PLAIN"),
        )
    }

    pub fn timed_out(&self, now: Instant) -> bool {
        self.state != State::Done && now >= self.step_deadline
    }

    fn touch(&mut self) {
        self.step_deadline = Instant::now() + STEP_TIMEOUT;
    }

    pub fn handle(&mut self, message: &Message) -> Result<Step, Error> {
        match &message.command {
            Command::AUTHENTICATE(challenge) => {
                if self.state != State::AwaitingChallenge {
                    return Ok(Step::Continue(vec![]));
                }

                if challenge != "+" {
                    return Err(Error::Authenticate);
                }

                self.touch();
                self.state = State::AwaitingResult;

                // authzid \0 authcid \0 password
                let payload = format!("\0{}\0{}", self.username, self.password);
                let encoded = BASE64.encode(payload.as_bytes());

                Ok(Step::Continue(vec![command!("AUTHENTICATE", encoded)]))
            }
            Command::Numeric(numeric, _) => match numeric {
                Numeric::RPL_SASLSUCCESS => {
                    self.state = State::Done;
                    Ok(Step::Success)
                }
                Numeric::RPL_LOGGEDIN => Ok(Step::Continue(vec![])),
                Numeric::ERR_SASLFAIL | Numeric::ERR_NICKLOCKED => Err(Error::Denied),
                Numeric::ERR_SASLTOOLONG
                | Numeric::ERR_SASLABORTED
                | Numeric::ERR_SASLALREADY => Err(Error::Authenticate),
                Numeric::RPL_SASLMECHS => Err(Error::UnsupportedMechanism),
                _ => Ok(Step::Unhandled),
            },
            _ => Ok(Step::Unhandled),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("authentication exchange failed")]
    Authenticate,
    #[error("credentials rejected")]
    Denied,
    #[error("authentication timed out")]
    Timeout,
    #[error("server does not support PLAIN")]
    UnsupportedMechanism,
}

#[cfg(test)]
mod test {
    use irc::proto::{format, parse};

    use super::*;

    fn server(line: &str) -> Message {
        parse::message(&format!("{line}\r\n")).unwrap()
    }

    #[test]
    fn plain_exchange() {
        let (mut auth, opening) =
            Authentication::start("alice".into(), "secret".into());
        assert_eq!(
            format::message(opening).trim_end(),
            "AUTHENTICATE PLAIN"
        );

        let step = auth.handle(&server("AUTHENTICATE +")).unwrap();
        let Step::Continue(messages) = step else {
            panic!("expected credentials");
        };
        assert_eq!(
            format::message(messages[0].clone()).trim_end(),
            // base64 of \0alice\0secret
            "AUTHENTICATE AGFsaWNlAHNlY3JldA=="
        );

        let step = auth
            .handle(&server(":irc.test 903 alice :SASL authentication successful"))
            .unwrap();
        assert!(matches!(step, Step::Success));
    }

    #[test]
    fn failures_map_to_variants() {
        let failures = [
            (":irc.test 904 alice :SASL authentication failed", Error::Denied),
            (":irc.test 902 alice :You must use a nick assigned to you", Error::Denied),
            (":irc.test 905 alice :SASL message too long", Error::Authenticate),
            (":irc.test 906 alice :SASL authentication aborted", Error::Authenticate),
            (":irc.test 907 alice :You have already authenticated", Error::Authenticate),
            (":irc.test 908 alice EXTERNAL :are available mechanisms", Error::UnsupportedMechanism),
        ];

        for (line, expected) in failures {
            let (mut auth, _) = Authentication::start("alice".into(), "secret".into());
            assert_eq!(auth.handle(&server(line)).unwrap_err(), expected);
        }
    }

    #[test]
    fn unexpected_challenge_aborts() {
        let (mut auth, _) = Authentication::start("alice".into(), "secret".into());
        assert_eq!(
            auth.handle(&server("AUTHENTICATE challenge")).unwrap_err(),
            Error::Authenticate
        );
    }

    #[tokio::test(start_paused = true)]
    async fn step_deadline() {
        let (auth, _) = Authentication::start("alice".into(), "secret".into());

        assert!(!auth.timed_out(Instant::now()));
        tokio::time::advance(STEP_TIMEOUT + Duration::from_secs(1)).await;
        assert!(auth.timed_out(Instant::now()));
    }
}

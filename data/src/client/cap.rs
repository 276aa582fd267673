use std::collections::BTreeSet;
use std::time::Duration;

use tokio::time::Instant;

use irc::proto::{command, Command, Message};

pub const OVERALL_TIMEOUT: Duration = Duration::from_secs(15);
pub const STEP_TIMEOUT: Duration = Duration::from_secs(7);

/// `Idle -> Listing -> Requesting -> Acking -> SaslAwait -> Done`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Listing,
    Requesting,
    Acking,
    SaslAwait,
    Done,
}

/// What the negotiation wants after consuming a message.
#[derive(Debug)]
pub enum Step {
    /// Send these and keep feeding messages.
    Continue(Vec<Message>),
    /// `sasl` was acked: start authentication, `CAP END` is held.
    StartSasl(Vec<Message>),
    /// Negotiation finished; `CAP END` is included when it was ours to
    /// send.
    Done(Vec<Message>),
    /// Not a CAP message.
    Unhandled,
}

/// IRCv3 capability handshake. Fed parsed messages by the orchestrator;
/// produces the outbound side of the exchange.
#[derive(Debug)]
pub struct Negotiation {
    state: State,
    desired: BTreeSet<String>,
    supported: BTreeSet<String>,
    pending: BTreeSet<String>,
    acked: BTreeSet<String>,
    sasl_credentials: bool,
    started: Instant,
    step_deadline: Instant,
}

impl Negotiation {
    /// Returns the negotiation and the opening `CAP LS 302`.
    pub fn start(desired: BTreeSet<String>, sasl_credentials: bool) -> (Self, Message) {
        let now = Instant::now();

        (
            Self {
                state: State::Listing,
                desired,
                supported: BTreeSet::new(),
                pending: BTreeSet::new(),
                acked: BTreeSet::new(),
                sasl_credentials,
                started: now,
                step_deadline: now + STEP_TIMEOUT,
            },
            command!("CAP", "LS", "302"),
        )
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn negotiated(&self) -> &BTreeSet<String> {
        &self.acked
    }

    pub fn enabled(&self, cap: &str) -> bool {
        self.acked.contains(cap)
    }

    /// True once either the per-step or the overall deadline passed.
    pub fn timed_out(&self, now: Instant) -> bool {
        self.state != State::Done
            && (now >= self.step_deadline || now >= self.started + OVERALL_TIMEOUT)
    }

    fn touch(&mut self) {
        self.step_deadline = Instant::now() + STEP_TIMEOUT;
    }

    pub fn handle(&mut self, message: &Message) -> Step {
        let Command::CAP(_, subcommand, a, b) = &message.command else {
            return Step::Unhandled;
        };

        match subcommand.to_uppercase().as_str() {
            "LS" => {
                if self.state != State::Listing {
                    return Step::Continue(vec![]);
                }
                self.touch();

                // `CAP * LS * :caps` marks a continuation line
                let (more, caps) = match (a.as_deref(), b.as_deref()) {
                    (Some("*"), Some(caps)) => (true, caps),
                    (Some(caps), None) => (false, caps),
                    (_, Some(caps)) => (false, caps),
                    _ => (false, ""),
                };

                self.supported.extend(
                    caps.split_whitespace()
                        // cap values (`sasl=PLAIN,EXTERNAL`) are not
                        // tracked
                        .map(|cap| {
                            cap.split_once('=')
                                .map(|(name, _)| name)
                                .unwrap_or(cap)
                                .to_string()
                        }),
                );

                if more {
                    return Step::Continue(vec![]);
                }

                let mut request = self
                    .desired
                    .intersection(&self.supported)
                    .cloned()
                    .collect::<BTreeSet<_>>();

                if !self.sasl_credentials {
                    request.remove("sasl");
                }

                if request.is_empty() {
                    // Nothing to request; an empty LS completes with an
                    // empty negotiated set
                    self.state = State::Done;
                    return Step::Done(vec![command!("CAP", "END")]);
                }

                self.pending = request.clone();
                self.state = State::Requesting;

                let caps = request.into_iter().collect::<Vec<_>>().join(" ");
                Step::Continue(vec![command!("CAP", "REQ", caps)])
            }
            "ACK" => {
                if !matches!(self.state, State::Requesting | State::Acking) {
                    return Step::Continue(vec![]);
                }
                self.touch();
                self.state = State::Acking;

                let caps = a.as_deref().unwrap_or_default();
                for cap in caps.split_whitespace() {
                    self.pending.remove(cap);
                    self.acked.insert(cap.to_string());
                }

                self.finish_requests()
            }
            "NAK" => {
                if !matches!(self.state, State::Requesting | State::Acking) {
                    return Step::Continue(vec![]);
                }
                self.touch();
                self.state = State::Acking;

                let caps = a.as_deref().unwrap_or_default();
                for cap in caps.split_whitespace() {
                    self.pending.remove(cap);
                }

                self.finish_requests()
            }
            // cap-notify: the server may grow/shrink its set later
            "NEW" => {
                if let Some(caps) = a.as_deref().or(b.as_deref()) {
                    self.supported
                        .extend(caps.split_whitespace().map(String::from));
                }
                Step::Continue(vec![])
            }
            "DEL" => {
                if let Some(caps) = a.as_deref().or(b.as_deref()) {
                    for cap in caps.split_whitespace() {
                        self.supported.remove(cap);
                        self.acked.remove(cap);
                    }
                }
                Step::Continue(vec![])
            }
            _ => Step::Continue(vec![]),
        }
    }

    fn finish_requests(&mut self) -> Step {
        if !self.pending.is_empty() {
            return Step::Continue(vec![]);
        }

        if self.acked.contains("sasl") {
            // CAP END waits for the SASL flow to reach a terminal state
            self.state = State::SaslAwait;
            Step::StartSasl(vec![])
        } else {
            self.state = State::Done;
            Step::Done(vec![command!("CAP", "END")])
        }
    }

    /// SASL reported terminal (success or failure): release `CAP END`.
    pub fn sasl_finished(&mut self) -> Step {
        match self.state {
            State::SaslAwait => {
                self.state = State::Done;
                Step::Done(vec![command!("CAP", "END")])
            }
            _ => Step::Continue(vec![]),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("capability negotiation timed out")]
    Timeout,
}

#[cfg(test)]
mod test {
    use irc::proto::parse;

    use super::*;

    fn caps(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(ToString::to_string).collect()
    }

    fn server(line: &str) -> Message {
        parse::message(&format!("{line}\r\n")).unwrap()
    }

    fn sent(step: &Step) -> Vec<String> {
        let messages = match step {
            Step::Continue(m) | Step::StartSasl(m) | Step::Done(m) => m,
            Step::Unhandled => panic!("unhandled"),
        };
        messages
            .iter()
            .map(|m| irc::proto::format::message(m.clone()).trim_end().to_string())
            .collect()
    }

    #[test]
    fn empty_ls_completes_with_empty_set() {
        let (mut negotiation, opening) =
            Negotiation::start(caps(&["sasl", "multi-prefix"]), true);
        assert_eq!(
            irc::proto::format::message(opening).trim_end(),
            "CAP LS 302"
        );

        let step = negotiation.handle(&server(":irc.test CAP * LS :"));
        assert!(matches!(step, Step::Done(_)));
        assert_eq!(sent(&step), vec!["CAP END"]);
        assert!(negotiation.negotiated().is_empty());
        assert_eq!(negotiation.state(), State::Done);
    }

    #[test]
    fn requests_the_intersection() {
        let (mut negotiation, _) =
            Negotiation::start(caps(&["multi-prefix", "server-time", "sasl"]), false);

        let step = negotiation.handle(&server(
            ":irc.test CAP * LS :multi-prefix sasl=PLAIN account-tag",
        ));

        // sasl dropped without credentials
        assert_eq!(sent(&step), vec!["CAP REQ multi-prefix"]);

        let step = negotiation.handle(&server(":irc.test CAP * ACK :multi-prefix"));
        assert!(matches!(step, Step::Done(_)));
        assert_eq!(sent(&step), vec!["CAP END"]);
        assert!(negotiation.enabled("multi-prefix"));
    }

    #[test]
    fn multiline_ls_accumulates() {
        let (mut negotiation, _) = Negotiation::start(caps(&["server-time"]), false);

        let step = negotiation.handle(&server(":irc.test CAP * LS * :multi-prefix sasl"));
        assert!(matches!(step, Step::Continue(ref m) if m.is_empty()));

        let step = negotiation.handle(&server(":irc.test CAP * LS :server-time"));
        assert_eq!(sent(&step), vec!["CAP REQ server-time"]);
    }

    #[test]
    fn cap_end_held_for_sasl() {
        let (mut negotiation, _) = Negotiation::start(caps(&["sasl", "server-time"]), true);

        negotiation.handle(&server(":irc.test CAP * LS :sasl server-time"));
        let step = negotiation.handle(&server(":irc.test CAP * ACK :sasl server-time"));

        // CAP END withheld until SASL reports terminal
        assert!(matches!(step, Step::StartSasl(ref m) if m.is_empty()));
        assert_eq!(negotiation.state(), State::SaslAwait);

        let step = negotiation.sasl_finished();
        assert_eq!(sent(&step), vec!["CAP END"]);
        assert_eq!(negotiation.state(), State::Done);
    }

    #[test]
    fn nak_still_completes() {
        let (mut negotiation, _) =
            Negotiation::start(caps(&["multi-prefix", "server-time"]), false);

        negotiation.handle(&server(":irc.test CAP * LS :multi-prefix server-time"));
        negotiation.handle(&server(":irc.test CAP * ACK :multi-prefix"));
        let step = negotiation.handle(&server(":irc.test CAP * NAK :server-time"));

        assert!(matches!(step, Step::Done(_)));
        assert!(negotiation.enabled("multi-prefix"));
        assert!(!negotiation.enabled("server-time"));
    }

    #[tokio::test(start_paused = true)]
    async fn deadlines() {
        let (negotiation, _) = Negotiation::start(caps(&["sasl"]), true);

        assert!(!negotiation.timed_out(Instant::now()));

        tokio::time::advance(STEP_TIMEOUT + Duration::from_secs(1)).await;
        assert!(negotiation.timed_out(Instant::now()));
    }
}

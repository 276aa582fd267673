use regex::Regex;

use crate::event::Event;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// A slash command line fed back through the command surface.
    Command(String),
    /// A registered script hook, by name.
    Script(String),
}

/// Fires an action when a matching event is published. Patterns are
/// regexes over the event payload's nick/channel/text fields; absent
/// patterns match everything.
#[derive(Debug)]
pub struct Rule {
    pub id: u32,
    pub event: String,
    pub nick: Option<Regex>,
    pub channel: Option<Regex>,
    pub text: Option<Regex>,
    pub action: Action,
    pub enabled: bool,
}

impl Rule {
    fn matches(&self, event: &Event) -> bool {
        if !self.enabled || self.event != event.name {
            return false;
        }

        let field = |key: &str| {
            event
                .payload
                .get(key)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };

        let first_of = |a: &str, b: &str| {
            let value = field(a);
            if value.is_empty() {
                field(b)
            } else {
                value
            }
        };

        let check = |pattern: &Option<Regex>, value: String| match pattern {
            Some(regex) => regex.is_match(&value),
            None => true,
        };

        check(&self.nick, field("nick"))
            && check(&self.channel, first_of("channel", "target"))
            && check(&self.text, first_of("text", "message"))
    }
}

#[derive(Debug, Default)]
pub struct Set {
    rules: Vec<Rule>,
    next_id: u32,
}

impl Set {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &mut self,
        event: impl ToString,
        nick: Option<&str>,
        channel: Option<&str>,
        text: Option<&str>,
        action: Action,
    ) -> Result<u32, Error> {
        let compile = |pattern: Option<&str>| -> Result<Option<Regex>, Error> {
            pattern
                .map(|p| Regex::new(p).map_err(|e| Error::Pattern(p.to_string(), e)))
                .transpose()
        };

        self.next_id += 1;
        let id = self.next_id;

        self.rules.push(Rule {
            id,
            event: event.to_string(),
            nick: compile(nick)?,
            channel: compile(channel)?,
            text: compile(text)?,
            action,
            enabled: true,
        });

        Ok(id)
    }

    pub fn remove(&mut self, id: u32) -> bool {
        let before = self.rules.len();
        self.rules.retain(|rule| rule.id != id);
        before != self.rules.len()
    }

    pub fn set_enabled(&mut self, id: u32, enabled: bool) -> bool {
        match self.rules.iter_mut().find(|rule| rule.id == id) {
            Some(rule) => {
                rule.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn list(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter()
    }

    /// Actions to fire for a published event, in rule order.
    pub fn matches(&self, event: &Event) -> Vec<&Action> {
        self.rules
            .iter()
            .filter(|rule| rule.matches(event))
            .map(|rule| &rule.action)
            .collect()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid pattern {0:?}: {1}")]
    Pattern(String, regex::Error),
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    #[test]
    fn matching() {
        let mut set = Set::new();
        let id = set
            .add(
                "PRIVMSG",
                Some("^bob$"),
                Some("#tern"),
                Some("(?i)hello"),
                Action::Command("/say hi bob".into()),
            )
            .unwrap();

        let hit = Event::new(
            "PRIVMSG",
            json!({"nick": "bob", "channel": "#tern", "text": "Hello there"}),
        );
        let wrong_nick = Event::new(
            "PRIVMSG",
            json!({"nick": "eve", "channel": "#tern", "text": "hello"}),
        );
        let wrong_event = Event::new(
            "NOTICE",
            json!({"nick": "bob", "channel": "#tern", "text": "hello"}),
        );

        assert_eq!(set.matches(&hit).len(), 1);
        assert!(set.matches(&wrong_nick).is_empty());
        assert!(set.matches(&wrong_event).is_empty());

        set.set_enabled(id, false);
        assert!(set.matches(&hit).is_empty());

        set.set_enabled(id, true);
        assert!(set.remove(id));
        assert!(set.matches(&hit).is_empty());
    }

    #[test]
    fn bad_pattern_is_rejected() {
        let mut set = Set::new();
        assert!(set
            .add("PRIVMSG", Some("("), None, None, Action::Script("x".into()))
            .is_err());
    }
}

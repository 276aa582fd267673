use std::fmt;

use serde::{Deserialize, Serialize};

use irc::proto;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Nick(String);

impl Nick {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Nick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for Nick {
    fn from(nick: &str) -> Self {
        Nick(nick.to_string())
    }
}

impl From<String> for Nick {
    fn from(nick: String) -> Self {
        Nick(nick)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub nickname: Nick,
    pub username: Option<String>,
    pub hostname: Option<String>,
    pub accountname: Option<String>,
    pub away: bool,
}

impl User {
    pub fn new(nickname: Nick) -> Self {
        Self {
            nickname,
            username: None,
            hostname: None,
            accountname: None,
            away: false,
        }
    }

    pub fn hostmask(&self) -> String {
        let mut out = self.nickname.to_string();
        if let Some(username) = &self.username {
            out.push('!');
            out.push_str(username);
        }
        if let Some(hostname) = &self.hostname {
            out.push('@');
            out.push_str(hostname);
        }
        out
    }
}

impl From<proto::User> for User {
    fn from(user: proto::User) -> Self {
        Self {
            nickname: Nick(user.nickname),
            username: user.username,
            hostname: user.hostname,
            accountname: None,
            away: false,
        }
    }
}

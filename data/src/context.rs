use std::collections::{BTreeSet, HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::isupport::CaseMap;
use crate::user::Nick;

pub const STATUS: &str = "status";

/// Default scrollback cap for interactive use; headless runs keep more.
pub const DEFAULT_SCROLLBACK: usize = 500;
pub const HEADLESS_SCROLLBACK: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Status,
    Channel,
    Query,
}

/// Channel join lifecycle, driven by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinStatus {
    Pending,
    JoinSent,
    Joined,
    FullyJoined,
    Parted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Line {
    pub sent_at: DateTime<Utc>,
    pub text: String,
}

impl Line {
    pub fn new(text: impl ToString) -> Self {
        Self {
            sent_at: Utc::now(),
            text: text.to_string(),
        }
    }
}

/// Channel membership entry with the full (multi-prefix) prefix set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership {
    pub nick: Nick,
    pub prefixes: BTreeSet<char>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Topic {
    pub text: Option<String>,
    pub who: Option<String>,
    pub time: Option<DateTime<Utc>>,
}

/// A named message buffer (status, channel, or query) backed by a
/// bounded ring of rendered lines.
#[derive(Debug, Clone)]
pub struct Context {
    key: String,
    pub kind: Kind,
    lines: VecDeque<Line>,
    limit: usize,
    pub scroll_offset: usize,
    last_read: u64,
    appended: u64,
    pub active: bool,
    pub join_status: Option<JoinStatus>,
    pub topic: Topic,
    pub modes: BTreeSet<char>,
    users: HashMap<String, Membership>,
}

impl Context {
    fn new(key: String, kind: Kind, limit: usize) -> Self {
        Self {
            key,
            kind,
            lines: VecDeque::with_capacity(limit.min(64)),
            limit,
            scroll_offset: 0,
            last_read: 0,
            appended: 0,
            active: true,
            join_status: matches!(kind, Kind::Channel).then_some(JoinStatus::Pending),
            topic: Topic::default(),
            modes: BTreeSet::new(),
            users: HashMap::new(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Appends a rendered line, evicting the oldest past the cap.
    pub fn append(&mut self, line: Line) {
        if self.lines.len() == self.limit {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
        self.appended += 1;
    }

    pub fn iter_from(&self, offset: usize) -> impl Iterator<Item = &Line> {
        self.lines.iter().skip(offset)
    }

    pub fn lines(&self) -> impl Iterator<Item = &Line> {
        self.lines.iter()
    }

    pub fn clear(&mut self) {
        self.lines.clear();
        self.mark_read();
    }

    pub fn mark_read(&mut self) {
        self.last_read = self.appended;
    }

    /// Lines appended since the last-read marker.
    pub fn unread(&self) -> u64 {
        self.appended - self.last_read
    }

    pub fn users(&self) -> impl Iterator<Item = &Membership> {
        self.users.values()
    }

    pub fn user(&self, key: &str) -> Option<&Membership> {
        self.users.get(key)
    }

    pub fn insert_user(&mut self, key: String, membership: Membership) {
        self.users.insert(key, membership);
    }

    pub fn remove_user(&mut self, key: &str) -> Option<Membership> {
        self.users.remove(key)
    }

    pub fn rename_user(&mut self, old_key: &str, new_key: String, nick: Nick) {
        if let Some(mut membership) = self.users.remove(old_key) {
            membership.nick = nick;
            self.users.insert(new_key, membership);
        }
    }

    pub fn clear_users(&mut self) {
        self.users.clear();
    }

    pub fn has_user(&self, key: &str) -> bool {
        self.users.contains_key(key)
    }

    fn snapshot(&self, tail: usize) -> Snapshot {
        Snapshot {
            key: self.key.clone(),
            kind: self.kind,
            lines: self
                .lines
                .iter()
                .rev()
                .take(tail)
                .rev()
                .cloned()
                .collect(),
        }
    }
}

/// The serializable subset of a context: identity plus a bounded
/// scrollback tail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub key: String,
    pub kind: Kind,
    pub lines: Vec<Line>,
}

/// All contexts, addressable by canonical key and enumerated in a
/// stable order: status first, channels in join order, queries in
/// first-message order.
#[derive(Debug)]
pub struct Map {
    casemap: CaseMap,
    limit: usize,
    order: Vec<String>,
    map: HashMap<String, Context>,
}

impl Map {
    pub fn new(limit: usize) -> Self {
        let mut map = Self {
            casemap: CaseMap::default(),
            limit,
            order: vec![],
            map: HashMap::new(),
        };
        map.insert(STATUS.to_string(), Kind::Status);
        map
    }

    pub fn set_casemap(&mut self, casemap: CaseMap) {
        self.casemap = casemap;
    }

    pub fn casemap(&self) -> CaseMap {
        self.casemap
    }

    /// Channel names are canonicalized through the server casemapping;
    /// the status key and query nicks keep their case but are also
    /// matched case-insensitively.
    pub fn canonical(&self, name: &str) -> String {
        self.casemap.lower(name)
    }

    fn insert(&mut self, key: String, kind: Kind) -> &mut Context {
        if !self.map.contains_key(&key) {
            self.order.push(key.clone());
        }
        let limit = self.limit;
        self.map
            .entry(key.clone())
            .or_insert_with(|| Context::new(key, kind, limit))
    }

    pub fn status_mut(&mut self) -> &mut Context {
        self.map.get_mut(STATUS).expect("status context always exists")
    }

    pub fn get(&self, name: &str) -> Option<&Context> {
        self.map.get(&self.canonical(name))
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Context> {
        let key = self.canonical(name);
        self.map.get_mut(&key)
    }

    /// Returns the channel context, creating it on first use (join
    /// order is preserved by creation order).
    pub fn ensure_channel(&mut self, name: &str) -> &mut Context {
        let key = self.canonical(name);
        self.insert(key, Kind::Channel)
    }

    /// Returns the query context for a nick, creating it on first
    /// inbound or outbound message.
    pub fn ensure_query(&mut self, nick: &str) -> &mut Context {
        let key = self.canonical(nick);
        self.insert(key, Kind::Query)
    }

    /// `status` first, then channels in join order, then queries in
    /// first-message order.
    pub fn iter(&self) -> impl Iterator<Item = &Context> {
        let by_kind = move |kind: Kind| {
            self.order
                .iter()
                .filter_map(move |key| self.map.get(key).filter(|c| c.kind == kind))
        };

        by_kind(Kind::Status)
            .chain(by_kind(Kind::Channel))
            .chain(by_kind(Kind::Query))
    }

    pub fn snapshots(&self, tail: usize) -> Vec<Snapshot> {
        self.iter().map(|context| context.snapshot(tail)).collect()
    }

    pub fn restore(&mut self, snapshots: Vec<Snapshot>) {
        for snapshot in snapshots {
            let context = self.insert(snapshot.key, snapshot.kind);
            for line in snapshot.lines {
                context.append(line);
            }
            context.mark_read();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ring_eviction() {
        let mut context = Context::new("#chan".into(), Kind::Channel, 3);

        for i in 0..5 {
            context.append(Line::new(format!("line {i}")));
        }

        let texts = context.lines().map(|l| l.text.as_str()).collect::<Vec<_>>();
        assert_eq!(texts, vec!["line 2", "line 3", "line 4"]);
        assert_eq!(context.unread(), 5);

        context.mark_read();
        assert_eq!(context.unread(), 0);

        let from_offset = context
            .iter_from(1)
            .map(|l| l.text.as_str())
            .collect::<Vec<_>>();
        assert_eq!(from_offset, vec!["line 3", "line 4"]);
    }

    #[test]
    fn enumeration_order() {
        let mut map = Map::new(10);

        // Query arrives before any channel join
        map.ensure_query("Alice");
        map.ensure_channel("#Beta");
        map.ensure_channel("#alpha");
        map.ensure_query("bob");

        let keys = map.iter().map(|c| c.key().to_string()).collect::<Vec<_>>();
        assert_eq!(keys, vec![STATUS, "#beta", "#alpha", "alice", "bob"]);
    }

    #[test]
    fn canonical_channel_lookup() {
        let mut map = Map::new(10);
        map.ensure_channel("#Rust[Lang]");

        assert!(map.get("#rust{lang}").is_some());
        assert_eq!(map.get("#RUST[LANG]").unwrap().kind, Kind::Channel);
    }

    #[test]
    fn snapshot_tail() {
        let mut map = Map::new(10);
        let channel = map.ensure_channel("#chan");
        for i in 0..8 {
            channel.append(Line::new(format!("m{i}")));
        }

        let snapshots = map.snapshots(3);
        let chan = snapshots.iter().find(|s| s.key == "#chan").unwrap();
        assert_eq!(
            chan.lines.iter().map(|l| l.text.as_str()).collect::<Vec<_>>(),
            vec!["m5", "m6", "m7"]
        );
    }
}

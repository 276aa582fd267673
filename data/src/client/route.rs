use std::collections::HashMap;

use chrono::{TimeZone, Utc};
use serde_json::json;

use irc::proto::{Command, Message, Numeric, Source};

use crate::context::{JoinStatus, Line, Membership};
use crate::event::{Bus, Event};
use crate::store::Store;
use crate::user::Nick;
use crate::{ctcp, dcc, environment, isupport, mode};

/// Inbound DCC requests surfaced to the transfer manager.
#[derive(Debug)]
pub enum DccInbound {
    Offer { from: Nick, send: dcc::Send },
    Resume { from: Nick, transfer: dcc::Transfer },
    Accept { from: Nick, transfer: dcc::Transfer },
}

/// What a single dispatched line produced. Handlers only enqueue;
/// they never touch I/O.
#[derive(Debug, Default)]
pub struct Output {
    pub outbound: Vec<Message>,
    pub dcc: Option<DccInbound>,
}

impl Output {
    fn reply(message: Message) -> Self {
        Self {
            outbound: vec![message],
            dcc: None,
        }
    }
}

/// Routes parsed messages to per-verb handlers, maintaining the
/// channel/user model in the store. One line is fully applied before
/// the next begins.
pub struct Router {
    nick: String,
    isupport: isupport::Table,
    pending_names: HashMap<String, Vec<Membership>>,
}

impl Router {
    pub fn new(nick: impl ToString) -> Self {
        Self {
            nick: nick.to_string(),
            isupport: isupport::Table::default(),
            pending_names: HashMap::new(),
        }
    }

    pub fn nick(&self) -> &str {
        &self.nick
    }

    pub fn isupport(&self) -> &isupport::Table {
        &self.isupport
    }

    fn lower(&self, value: &str) -> String {
        self.isupport.casemap.lower(value)
    }

    fn is_self(&self, nick: &str) -> bool {
        self.lower(nick) == self.lower(&self.nick)
    }

    /// Appends to a context and publishes the same text on the bus.
    fn deliver(
        &self,
        store: &Store,
        bus: &Bus,
        target: ContextTarget<'_>,
        text: String,
        event: &str,
        mut payload: serde_json::Value,
    ) {
        store.contexts_mut(|contexts| {
            let context = match target {
                ContextTarget::Status => contexts.status_mut(),
                ContextTarget::Channel(name) => contexts.ensure_channel(name),
                ContextTarget::Query(nick) => contexts.ensure_query(nick),
            };
            context.append(Line::new(&text));
        });

        if let Some(object) = payload.as_object_mut() {
            object.insert("text".to_string(), json!(text));
        }
        bus.publish(Event::new(event, payload));
    }

    fn status(&self, store: &Store, bus: &Bus, text: impl ToString) {
        self.deliver(
            store,
            bus,
            ContextTarget::Status,
            text.to_string(),
            "STATUS",
            json!({}),
        );
    }

    pub fn handle(
        &mut self,
        message: &Message,
        store: &Store,
        bus: &Bus,
    ) -> Result<Output, Error> {
        match &message.command {
            // Never user-visible
            Command::PING(token) => {
                Ok(Output::reply(Command::PONG(token.clone(), None).into()))
            }
            Command::PONG(..) => Ok(Output::default()),

            Command::PRIVMSG(target, text) => {
                Ok(self.privmsg(message, target, text, store, bus))
            }
            Command::NOTICE(target, text) => {
                self.notice(message, target, text, store, bus);
                Ok(Output::default())
            }

            Command::JOIN(channel, account) => {
                self.join(message, channel, account.as_deref(), store, bus);
                Ok(Output::default())
            }
            Command::PART(channel, reason) => {
                self.part(message, channel, reason.as_deref(), store, bus);
                Ok(Output::default())
            }
            Command::KICK(channel, victim, reason) => {
                self.kick(message, channel, victim, reason.as_deref(), store, bus);
                Ok(Output::default())
            }
            Command::QUIT(reason) => {
                self.quit(message, reason.as_deref(), store, bus);
                Ok(Output::default())
            }
            Command::NICK(new_nick) => {
                self.nick_change(message, new_nick, store, bus);
                Ok(Output::default())
            }
            Command::MODE(target, modestring, args) => {
                self.mode(
                    message,
                    target,
                    modestring.as_deref(),
                    args.as_deref().unwrap_or_default(),
                    store,
                    bus,
                );
                Ok(Output::default())
            }
            Command::TOPIC(channel, topic) => {
                self.topic(message, channel, topic.as_deref(), store, bus);
                Ok(Output::default())
            }

            Command::AWAY(reason) => {
                if let Some(nick) = source_nick(message) {
                    bus.publish(Event::new(
                        "USER_AWAY",
                        json!({
                            "nick": nick,
                            "away": reason.is_some(),
                            "message": reason,
                        }),
                    ));
                }
                Ok(Output::default())
            }
            Command::ACCOUNT(account) => {
                if let Some(nick) = source_nick(message) {
                    bus.publish(Event::new(
                        "ACCOUNT",
                        json!({
                            "nick": nick,
                            "account": (account != "*").then_some(account),
                        }),
                    ));
                }
                Ok(Output::default())
            }
            Command::CHGHOST(new_username, new_hostname) => {
                if let Some(nick) = source_nick(message) {
                    bus.publish(Event::new(
                        "CHGHOST",
                        json!({
                            "nick": nick,
                            "new_ident": new_username,
                            "new_host": new_hostname,
                        }),
                    ));
                }
                Ok(Output::default())
            }
            Command::INVITE(nick, channel) => {
                if self.is_self(nick) {
                    let by = source_nick(message).unwrap_or_default();
                    self.status(store, bus, format!("{by} invites you to {channel}"));
                    bus.publish(Event::new(
                        "INVITE",
                        json!({"nick": by, "channel": channel}),
                    ));
                }
                Ok(Output::default())
            }

            // Fatal remote close
            Command::ERROR(reason) => Err(Error::Remote(reason.clone())),

            Command::Numeric(numeric, params) => {
                self.numeric(message, *numeric, params, store, bus);
                Ok(Output::default())
            }
            Command::Unknown(verb, params) => {
                // Numerics outside the known table still surface in
                // status with their human-readable text
                if let Ok(numeric) = verb.parse::<u16>() {
                    let text = params
                        .iter()
                        .skip(1)
                        .cloned()
                        .collect::<Vec<_>>()
                        .join(" ");
                    if !text.is_empty() {
                        self.status(store, bus, &text);
                    }

                    bus.publish(Event::new(
                        "RAW_IRC_NUMERIC",
                        json!({
                            "numeric": numeric,
                            "params": params,
                        }),
                    ));
                } else {
                    log::debug!("unhandled {verb} with {} params", params.len());
                }
                Ok(Output::default())
            }

            // Client-to-server verbs echoed by broken servers
            _ => Ok(Output::default()),
        }
    }

    fn privmsg(
        &mut self,
        message: &Message,
        target: &str,
        text: &str,
        store: &Store,
        bus: &Bus,
    ) -> Output {
        let Some(sender) = source_nick(message) else {
            // Server notices masquerading as PRIVMSG land in status
            self.status(store, bus, text);
            return Output::default();
        };

        let is_channel = self.isupport.is_channel(target);

        if ctcp::is_query(text) {
            if let Some(query) = ctcp::parse_query(text) {
                return self.ctcp(message, &sender, target, is_channel, query, store, bus);
            }
        }

        // With echo-message negotiated our own lines come back here and
        // are appended exactly once
        let context = if is_channel {
            ContextTarget::Channel(target)
        } else if self.is_self(&sender) {
            // Echoed self-message to a query we initiated
            ContextTarget::Query(target)
        } else {
            ContextTarget::Query(&sender)
        };

        self.deliver(
            store,
            bus,
            context,
            format!("<{sender}> {text}"),
            "PRIVMSG",
            json!({
                "nick": sender,
                "userhost": source_userhost(message),
                "target": target,
                "message": text,
                "is_channel_msg": is_channel,
                "tags": message.tags,
            }),
        );

        Output::default()
    }

    fn ctcp(
        &mut self,
        message: &Message,
        sender: &str,
        target: &str,
        is_channel: bool,
        query: ctcp::Query<'_>,
        store: &Store,
        bus: &Bus,
    ) -> Output {
        match query.command {
            ctcp::Command::Action => {
                let action = query.params.unwrap_or_default();
                let context = if is_channel {
                    ContextTarget::Channel(target)
                } else {
                    ContextTarget::Query(sender)
                };

                self.deliver(
                    store,
                    bus,
                    context,
                    format!("* {sender} {action}"),
                    "ACTION",
                    json!({
                        "nick": sender,
                        "target": target,
                        "message": action,
                        "is_channel_msg": is_channel,
                    }),
                );

                Output::default()
            }
            ctcp::Command::DCC => {
                let from = Nick::from(sender);
                let dcc = query
                    .params
                    .map(|params| format!("\u{1}DCC {params}\u{1}"))
                    .and_then(|text| dcc::decode(&text));

                let inbound = match dcc {
                    Some(dcc::Command::Send(send)) => {
                        Some(DccInbound::Offer { from, send })
                    }
                    Some(dcc::Command::Resume(transfer)) => {
                        Some(DccInbound::Resume { from, transfer })
                    }
                    Some(dcc::Command::Accept(transfer)) => {
                        Some(DccInbound::Accept { from, transfer })
                    }
                    None => {
                        log::debug!("undecodable DCC request from {sender}");
                        None
                    }
                };

                Output {
                    outbound: vec![],
                    dcc: inbound,
                }
            }
            // Minimal replies, never echoed to a context
            ctcp::Command::Version => Output::reply(notice(
                sender,
                ctcp::format(&ctcp::Command::Version, Some(&environment::version())),
            )),
            ctcp::Command::Ping => Output::reply(notice(
                sender,
                ctcp::format(&ctcp::Command::Ping, query.params),
            )),
            ctcp::Command::Time => Output::reply(notice(
                sender,
                ctcp::format(
                    &ctcp::Command::Time,
                    Some(&Utc::now().format("%a %b %e %H:%M:%S %Y").to_string()),
                ),
            )),
            ctcp::Command::ClientInfo | ctcp::Command::Unknown(_) => Output::default(),
        }
    }

    fn notice(
        &mut self,
        message: &Message,
        target: &str,
        text: &str,
        store: &Store,
        bus: &Bus,
    ) {
        // CTCP replies and server notices are not conversations
        let Some(sender) = source_nick(message) else {
            self.status(store, bus, text);
            return;
        };

        if ctcp::is_query(text) {
            log::debug!("CTCP reply from {sender}: {text:?}");
            return;
        }

        let is_channel = self.isupport.is_channel(target);
        let context = if is_channel {
            ContextTarget::Channel(target)
        } else {
            ContextTarget::Query(&sender)
        };

        self.deliver(
            store,
            bus,
            context,
            format!("-{sender}- {text}"),
            "NOTICE",
            json!({
                "nick": sender,
                "userhost": source_userhost(message),
                "target": target,
                "message": text,
                "is_channel_notice": is_channel,
                "tags": message.tags,
            }),
        );
    }

    fn join(
        &mut self,
        message: &Message,
        channel: &str,
        account: Option<&str>,
        store: &Store,
        bus: &Bus,
    ) {
        let Some(nick) = source_nick(message) else {
            return;
        };
        let is_self = self.is_self(&nick);
        let key = self.lower(&nick);

        store.contexts_mut(|contexts| {
            let context = contexts.ensure_channel(channel);

            if is_self {
                context.active = true;
                context.join_status = Some(JoinStatus::Joined);
                context.clear_users();
            } else {
                context.insert_user(
                    key,
                    Membership {
                        nick: Nick::from(nick.as_str()),
                        prefixes: Default::default(),
                    },
                );
            }
        });

        self.deliver(
            store,
            bus,
            ContextTarget::Channel(channel),
            format!("{nick} has joined {channel}"),
            "JOIN",
            json!({
                "nick": nick,
                "userhost": source_userhost(message),
                "channel": channel,
                // extended-join carries the account name, `*` if none
                "account": account.filter(|a| *a != "*"),
                "is_self": is_self,
            }),
        );
    }

    fn part(
        &mut self,
        message: &Message,
        channel: &str,
        reason: Option<&str>,
        store: &Store,
        bus: &Bus,
    ) {
        let Some(nick) = source_nick(message) else {
            return;
        };
        let is_self = self.is_self(&nick);
        let key = self.lower(&nick);

        store.contexts_mut(|contexts| {
            if let Some(context) = contexts.get_mut(channel) {
                if is_self {
                    // Kept around; the user may rejoin
                    context.active = false;
                    context.join_status = Some(JoinStatus::Parted);
                    context.clear_users();
                } else {
                    context.remove_user(&key);
                }
            }
        });

        let suffix = reason.map(|r| format!(" ({r})")).unwrap_or_default();
        self.deliver(
            store,
            bus,
            ContextTarget::Channel(channel),
            format!("{nick} has left {channel}{suffix}"),
            "PART",
            json!({
                "nick": nick,
                "userhost": source_userhost(message),
                "channel": channel,
                "reason": reason,
                "is_self": is_self,
            }),
        );
    }

    fn kick(
        &mut self,
        message: &Message,
        channel: &str,
        victim: &str,
        reason: Option<&str>,
        store: &Store,
        bus: &Bus,
    ) {
        let kicker = source_nick(message).unwrap_or_default();
        let is_self = self.is_self(victim);
        let key = self.lower(victim);

        store.contexts_mut(|contexts| {
            if let Some(context) = contexts.get_mut(channel) {
                if is_self {
                    context.active = false;
                    context.join_status = Some(JoinStatus::Parted);
                    context.clear_users();
                } else {
                    context.remove_user(&key);
                }
            }
        });

        let suffix = reason.map(|r| format!(" ({r})")).unwrap_or_default();
        self.deliver(
            store,
            bus,
            ContextTarget::Channel(channel),
            format!("{victim} was kicked by {kicker}{suffix}"),
            "KICK",
            json!({
                "nick": kicker,
                "channel": channel,
                "victim": victim,
                "reason": reason,
                "is_self": is_self,
            }),
        );
    }

    fn quit(
        &mut self,
        message: &Message,
        reason: Option<&str>,
        store: &Store,
        bus: &Bus,
    ) {
        let Some(nick) = source_nick(message) else {
            return;
        };
        let key = self.lower(&nick);
        let suffix = reason.map(|r| format!(" ({r})")).unwrap_or_default();
        let text = format!("{nick} has quit{suffix}");

        let affected = store.contexts_mut(|contexts| {
            let mut affected = vec![];
            let keys = contexts
                .iter()
                .map(|c| c.key().to_string())
                .collect::<Vec<_>>();

            for context_key in keys {
                if let Some(context) = contexts.get_mut(&context_key) {
                    if context.remove_user(&key).is_some() {
                        context.append(Line::new(&text));
                        affected.push(context_key);
                    }
                }
            }

            affected
        });

        bus.publish(Event::new(
            "QUIT",
            json!({
                "nick": nick,
                "userhost": source_userhost(message),
                "reason": reason,
                "channels": affected,
                "text": text,
            }),
        ));
    }

    fn nick_change(
        &mut self,
        message: &Message,
        new_nick: &str,
        store: &Store,
        bus: &Bus,
    ) {
        let Some(old_nick) = source_nick(message) else {
            return;
        };
        let is_self = self.is_self(&old_nick);
        let old_key = self.lower(&old_nick);
        let new_key = self.lower(new_nick);
        let text = format!("{old_nick} is now known as {new_nick}");

        store.contexts_mut(|contexts| {
            let keys = contexts
                .iter()
                .map(|c| c.key().to_string())
                .collect::<Vec<_>>();

            for context_key in keys {
                if let Some(context) = contexts.get_mut(&context_key) {
                    if context.has_user(&old_key) {
                        context.rename_user(
                            &old_key,
                            new_key.clone(),
                            Nick::from(new_nick),
                        );
                        context.append(Line::new(&text));
                    }
                }
            }
        });

        if is_self {
            self.nick = new_nick.to_string();

            if let Some(mut info) = store.connection_info() {
                info.nick = new_nick.to_string();
                if let Err(e) = store.set_connection_info(info) {
                    log::warn!("failed to record nick change: {e}");
                }
            }
        }

        bus.publish(Event::new(
            "NICK",
            json!({
                "old_nick": old_nick,
                "new_nick": new_nick,
                "userhost": source_userhost(message),
                "is_self": is_self,
                "text": text,
            }),
        ));
    }

    fn mode(
        &mut self,
        message: &Message,
        target: &str,
        modestring: Option<&str>,
        args: &[String],
        store: &Store,
        bus: &Bus,
    ) {
        let setter = source_nick(message).unwrap_or_default();

        let Some(modestring) = modestring else {
            return;
        };

        if !self.isupport.is_channel(target) {
            // Our own user modes
            self.status(store, bus, format!("mode {modestring} for {target}"));
            return;
        }

        let modes = mode::parse(modestring, args, &self.isupport);

        store.contexts_mut(|contexts| {
            let context = contexts.ensure_channel(target);

            for change in &modes {
                let (added, letter, arg) = match change {
                    mode::Mode::Add(c, arg) => (true, *c, arg.as_deref()),
                    mode::Mode::Remove(c, arg) => (false, *c, arg.as_deref()),
                    mode::Mode::NoPrefix(_) => continue,
                };

                if let Some(prefix) = self.isupport.mode_to_prefix(letter) {
                    // Membership mode: adjust the target user's prefix set
                    if let Some(nick) = arg {
                        let key = self.isupport.casemap.lower(nick);
                        if let Some(membership) = context.remove_user(&key) {
                            let mut membership = membership;
                            if added {
                                membership.prefixes.insert(prefix);
                            } else {
                                membership.prefixes.remove(&prefix);
                            }
                            context.insert_user(key, membership);
                        }
                    }
                } else {
                    let is_list_mode = self
                        .isupport
                        .chanmodes
                        .iter()
                        .any(|cm| cm.kind == 'A' && cm.modes.contains(letter));

                    // List modes (+b etc) are not channel state
                    if !is_list_mode {
                        if added {
                            context.modes.insert(letter);
                        } else {
                            context.modes.remove(&letter);
                        }
                    }
                }
            }
        });

        let deltas = modes
            .iter()
            .filter_map(|change| match change {
                mode::Mode::Add(c, arg) => Some(json!({
                    "op": "+", "mode": c.to_string(), "arg": arg,
                })),
                mode::Mode::Remove(c, arg) => Some(json!({
                    "op": "-", "mode": c.to_string(), "arg": arg,
                })),
                mode::Mode::NoPrefix(_) => None,
            })
            .collect::<Vec<_>>();

        let rendered_args = args.join(" ");
        let suffix = if rendered_args.is_empty() {
            String::new()
        } else {
            format!(" {rendered_args}")
        };

        self.deliver(
            store,
            bus,
            ContextTarget::Channel(target),
            format!("{setter} sets mode {modestring}{suffix} on {target}"),
            "CHANNEL_MODE_APPLIED",
            json!({
                "channel": target,
                "setter_nick": setter,
                "setter_userhost": source_userhost(message),
                "mode_changes": deltas,
            }),
        );
    }

    fn topic(
        &mut self,
        message: &Message,
        channel: &str,
        topic: Option<&str>,
        store: &Store,
        bus: &Bus,
    ) {
        let setter = source_nick(message).unwrap_or_default();

        store.contexts_mut(|contexts| {
            let context = contexts.ensure_channel(channel);
            context.topic.text = topic.map(String::from);
            context.topic.who = Some(setter.clone());
            context.topic.time = Some(Utc::now());
        });

        let text = match topic {
            Some(topic) => format!("{setter} changed the topic to: {topic}"),
            None => format!("{setter} cleared the topic"),
        };

        self.deliver(
            store,
            bus,
            ContextTarget::Channel(channel),
            text,
            "TOPIC",
            json!({
                "nick": setter,
                "channel": channel,
                "topic": topic,
            }),
        );
    }

    fn numeric(
        &mut self,
        message: &Message,
        numeric: Numeric,
        params: &[String],
        store: &Store,
        bus: &Bus,
    ) {
        use Numeric::*;

        match numeric {
            RPL_ISUPPORT => {
                // <nick> <token>{ <token>} :are supported by this server
                let tokens = params.iter().skip(1).take(params.len().saturating_sub(2));

                for token in tokens {
                    match isupport::Parameter::try_from(token.as_str()) {
                        Ok(parameter) => {
                            if let isupport::Parameter::CASEMAPPING(casemap) = &parameter {
                                store.contexts_mut(|contexts| {
                                    contexts.set_casemap(*casemap)
                                });
                            }
                            self.isupport.apply(parameter);
                        }
                        Err(_) => log::trace!("skipping ISUPPORT token {token:?}"),
                    }
                }
            }
            RPL_NOTOPIC => {
                if let Some(channel) = params.get(1) {
                    store.contexts_mut(|contexts| {
                        contexts.ensure_channel(channel).topic.text = None;
                    });
                }
            }
            RPL_TOPIC => {
                if let (Some(channel), Some(topic)) = (params.get(1), params.get(2)) {
                    store.contexts_mut(|contexts| {
                        contexts.ensure_channel(channel).topic.text =
                            Some(topic.clone());
                    });
                    self.deliver(
                        store,
                        bus,
                        ContextTarget::Channel(channel),
                        format!("topic: {topic}"),
                        "TOPIC",
                        json!({"channel": channel, "topic": topic, "nick": null}),
                    );
                }
            }
            RPL_TOPICWHOTIME => {
                if let (Some(channel), Some(who)) = (params.get(1), params.get(2)) {
                    let time = params
                        .get(3)
                        .and_then(|ts| ts.parse::<i64>().ok())
                        .and_then(|ts| Utc.timestamp_opt(ts, 0).single());

                    store.contexts_mut(|contexts| {
                        let context = contexts.ensure_channel(channel);
                        context.topic.who = Some(who.clone());
                        context.topic.time = time;
                    });
                }
            }
            RPL_NAMREPLY => {
                // <nick> <symbol> <channel> :<prefixed nicks>
                if let (Some(channel), Some(names)) = (params.get(2), params.get(3)) {
                    let key = self.lower(channel);
                    let prefixes = self.isupport.membership_prefixes();

                    let buffer = self.pending_names.entry(key).or_default();
                    for name in names.split_whitespace() {
                        let stripped = name.trim_start_matches(|c| prefixes.contains(&c));
                        let membership_prefixes = name
                            [..name.len() - stripped.len()]
                            .chars()
                            .collect();

                        // userhost-in-names: nick!user@host
                        let nick = stripped
                            .split_once('!')
                            .map(|(nick, _)| nick)
                            .unwrap_or(stripped);

                        buffer.push(Membership {
                            nick: Nick::from(nick),
                            prefixes: membership_prefixes,
                        });
                    }
                }
            }
            RPL_ENDOFNAMES => {
                if let Some(channel) = params.get(1) {
                    let key = self.lower(channel);
                    let members = self.pending_names.remove(&key).unwrap_or_default();
                    let count = members.len();

                    store.contexts_mut(|contexts| {
                        let context = contexts.ensure_channel(channel);
                        context.clear_users();
                        for membership in members {
                            let member_key =
                                self.isupport.casemap.lower(membership.nick.as_str());
                            context.insert_user(member_key, membership);
                        }
                        context.join_status = Some(JoinStatus::FullyJoined);
                    });

                    bus.publish(Event::new(
                        "CHANNEL_FULLY_JOINED",
                        json!({"channel_name": channel, "user_count": count}),
                    ));
                }
            }
            RPL_WELCOME | RPL_YOURHOST | RPL_CREATED | RPL_MYINFO | RPL_MOTD
            | RPL_MOTDSTART | RPL_ENDOFMOTD | ERR_NOMOTD => {
                if let Some(text) = params.last() {
                    self.status(store, bus, text);
                }
            }
            _ => {
                // Unknown numerics surface in status with their
                // human-readable trailing
                let text = params
                    .iter()
                    .skip(1)
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(" ");
                if !text.is_empty() {
                    self.status(store, bus, &text);
                }

                bus.publish(Event::new(
                    "RAW_IRC_NUMERIC",
                    json!({
                        "numeric": numeric as u16,
                        "params": params,
                        "source": message.source.as_ref().map(|s| match s {
                            Source::Server(server) => server.clone(),
                            Source::User(user) => user.nickname.clone(),
                        }),
                    }),
                ));
            }
        }
    }
}

enum ContextTarget<'a> {
    Status,
    Channel(&'a str),
    Query(&'a str),
}

fn source_nick(message: &Message) -> Option<String> {
    match message.source.as_ref()? {
        Source::User(user) => Some(user.nickname.clone()),
        Source::Server(_) => None,
    }
}

fn source_userhost(message: &Message) -> Option<String> {
    match message.source.as_ref()? {
        Source::User(user) => Some(format!(
            "{}@{}",
            user.username.as_deref().unwrap_or_default(),
            user.hostname.as_deref().unwrap_or_default()
        )),
        Source::Server(_) => None,
    }
}

fn notice(target: &str, text: String) -> Message {
    irc::proto::command("NOTICE", vec![target.to_string(), text])
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("server closed the session: {0}")]
    Remote(String),
}

#[cfg(test)]
mod test {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use irc::proto::{format, parse};

    use super::*;
    use crate::store::Store;

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Store,
        bus: Bus,
        events: Arc<Mutex<Vec<Event>>>,
        router: Router,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(
            dir.path().join("state.json"),
            100,
            Duration::from_secs(30),
            false,
        );
        let bus = Bus::new();

        let events: Arc<Mutex<Vec<Event>>> = Arc::default();
        for name in [
            "STATUS",
            "PRIVMSG",
            "NOTICE",
            "ACTION",
            "JOIN",
            "PART",
            "QUIT",
            "NICK",
            "KICK",
            "TOPIC",
            "CHANNEL_MODE_APPLIED",
            "CHANNEL_FULLY_JOINED",
        ] {
            let events = events.clone();
            bus.subscribe(name, move |event| {
                events.lock().unwrap().push(event.clone());
                Ok(())
            });
        }

        Fixture {
            _dir: dir,
            store,
            bus,
            events,
            router: Router::new("tern"),
        }
    }

    impl Fixture {
        fn handle(&mut self, line: &str) -> Output {
            let message = parse::message(&format!("{line}\r\n")).unwrap();
            self.router
                .handle(&message, &self.store, &self.bus)
                .unwrap()
        }

        fn lines(&self, context: &str) -> Vec<String> {
            self.store.contexts(|contexts| {
                contexts
                    .get(context)
                    .map(|c| c.lines().map(|l| l.text.clone()).collect())
                    .unwrap_or_default()
            })
        }

        fn event_names(&self) -> Vec<String> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .map(|e| e.name.clone())
                .collect()
        }
    }

    #[test]
    fn ping_replies_pong_without_output() {
        let mut fx = fixture();

        let output = fx.handle("PING :token123");
        let replies = output
            .outbound
            .iter()
            .map(|m| format::message(m.clone()).trim_end().to_string())
            .collect::<Vec<_>>();

        assert_eq!(replies, vec!["PONG token123"]);
        // Never user-visible
        assert!(fx.lines("status").is_empty());
    }

    #[test]
    fn privmsg_to_channel_appends_and_emits() {
        let mut fx = fixture();

        fx.handle("@account=bob :bob!b@h PRIVMSG #chan :hello world");

        assert_eq!(fx.lines("#chan"), vec!["<bob> hello world"]);

        let events = fx.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "PRIVMSG");
        assert_eq!(events[0].payload["text"], "<bob> hello world");
        assert_eq!(events[0].payload["is_channel_msg"], true);
    }

    #[test]
    fn private_message_creates_query_context() {
        let mut fx = fixture();

        fx.handle(":bob!b@h PRIVMSG tern :psst");

        assert_eq!(fx.lines("bob"), vec!["<bob> psst"]);
        fx.store.contexts(|contexts| {
            assert_eq!(
                contexts.get("bob").unwrap().kind,
                crate::context::Kind::Query
            );
        });
    }

    #[test]
    fn ctcp_action_renders_as_action() {
        let mut fx = fixture();

        fx.handle(":bob!b@h PRIVMSG #chan :\u{1}ACTION waves\u{1}");

        assert_eq!(fx.lines("#chan"), vec!["* bob waves"]);
        assert_eq!(fx.event_names(), vec!["ACTION"]);
    }

    #[test]
    fn ctcp_version_gets_minimal_notice() {
        let mut fx = fixture();

        let output = fx.handle(":bob!b@h PRIVMSG tern :\u{1}VERSION\u{1}");

        assert_eq!(output.outbound.len(), 1);
        let reply = format::message(output.outbound[0].clone());
        assert!(reply.starts_with("NOTICE bob :\u{1}VERSION tern"));
        // No context traffic for CTCP requests
        assert!(fx.lines("bob").is_empty());
    }

    #[test]
    fn dcc_send_is_surfaced_not_replied() {
        let mut fx = fixture();

        let output =
            fx.handle(":bob!b@h PRIVMSG tern :\u{1}DCC SEND file.bin 2130706433 5000 1024\u{1}");

        assert!(output.outbound.is_empty());
        assert!(matches!(
            output.dcc,
            Some(DccInbound::Offer { ref from, .. }) if from.as_str() == "bob"
        ));
    }

    #[test]
    fn join_part_updates_membership() {
        let mut fx = fixture();

        fx.handle(":tern!t@h JOIN #chan");
        fx.handle(":bob!b@h JOIN #chan");

        fx.store.contexts(|contexts| {
            let context = contexts.get("#chan").unwrap();
            assert!(context.has_user("bob"));
            assert_eq!(
                context.join_status,
                Some(crate::context::JoinStatus::Joined)
            );
        });

        fx.handle(":bob!b@h PART #chan :bye");
        fx.store.contexts(|contexts| {
            assert!(!contexts.get("#chan").unwrap().has_user("bob"));
        });

        // Self-part deactivates but keeps the context
        fx.handle(":tern!t@h PART #chan");
        fx.store.contexts(|contexts| {
            let context = contexts.get("#chan").unwrap();
            assert!(!context.active);
            assert_eq!(context.join_status, Some(JoinStatus::Parted));
        });
    }

    #[test]
    fn names_flush_sets_join_complete() {
        let mut fx = fixture();

        fx.handle(":tern!t@h JOIN #chan");
        fx.handle(":irc.test 353 tern = #chan :@alice!a@h +bob carol");
        fx.handle(":irc.test 366 tern #chan :End of /NAMES list");

        fx.store.contexts(|contexts| {
            let context = contexts.get("#chan").unwrap();
            assert_eq!(context.join_status, Some(JoinStatus::FullyJoined));
            assert_eq!(context.users().count(), 3);
            assert!(context.user("alice").unwrap().prefixes.contains(&'@'));
            assert!(context.user("bob").unwrap().prefixes.contains(&'+'));
            assert!(context.user("carol").unwrap().prefixes.is_empty());
        });

        assert!(fx
            .event_names()
            .contains(&"CHANNEL_FULLY_JOINED".to_string()));
    }

    #[test]
    fn multi_prefix_names_are_preserved() {
        let mut fx = fixture();

        fx.handle(":irc.test 005 tern PREFIX=(ov)@+ :are supported by this server");
        fx.handle(":irc.test 353 tern = #chan :@+alice");
        fx.handle(":irc.test 366 tern #chan :End of /NAMES list");

        fx.store.contexts(|contexts| {
            let prefixes = &contexts.get("#chan").unwrap().user("alice").unwrap().prefixes;
            assert!(prefixes.contains(&'@') && prefixes.contains(&'+'));
        });
    }

    #[test]
    fn nick_rewrites_all_memberships() {
        let mut fx = fixture();

        fx.handle(":irc.test 353 tern = #a :bob");
        fx.handle(":irc.test 366 tern #a :End");
        fx.handle(":irc.test 353 tern = #b :bob");
        fx.handle(":irc.test 366 tern #b :End");

        fx.handle(":bob!b@h NICK robert");

        fx.store.contexts(|contexts| {
            for channel in ["#a", "#b"] {
                let context = contexts.get(channel).unwrap();
                assert!(!context.has_user("bob"));
                assert!(context.has_user("robert"));
            }
        });
    }

    #[test]
    fn self_nick_updates_connection_info() {
        let mut fx = fixture();

        fx.store
            .set_connection_info(crate::store::ConnectionInfo {
                server: "irc.test".into(),
                port: 6667,
                use_tls: false,
                verify_tls: true,
                nick: "tern".into(),
                username: None,
                realname: None,
                server_password: None,
                nickserv_password: None,
                sasl_username: None,
                sasl_password: None,
                channels: vec![],
                caps: vec![],
                config_errors: vec![],
            })
            .unwrap();

        fx.handle(":tern!t@h NICK tern2");

        assert_eq!(fx.router.nick(), "tern2");
        assert_eq!(fx.store.connection_info().unwrap().nick, "tern2");
    }

    #[test]
    fn mode_applies_prefixes_and_channel_modes() {
        let mut fx = fixture();

        fx.handle(":irc.test 353 tern = #chan :bob");
        fx.handle(":irc.test 366 tern #chan :End");

        fx.handle(":op!o@h MODE #chan +ot bob");

        fx.store.contexts(|contexts| {
            let context = contexts.get("#chan").unwrap();
            assert!(context.user("bob").unwrap().prefixes.contains(&'@'));
            assert!(context.modes.contains(&'t'));
        });

        let events = fx.events.lock().unwrap();
        let mode_event = events
            .iter()
            .find(|e| e.name == "CHANNEL_MODE_APPLIED")
            .unwrap();
        let changes = mode_event.payload["mode_changes"].as_array().unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0]["op"], "+");
        assert_eq!(changes[0]["mode"], "o");
        assert_eq!(changes[0]["arg"], "bob");
    }

    #[test]
    fn isupport_casemapping_changes_lookup() {
        let mut fx = fixture();

        fx.handle(":irc.test 005 tern CASEMAPPING=ascii CHANTYPES=# :are supported by this server");

        assert_eq!(fx.router.isupport().casemap, isupport::CaseMap::ASCII);
        fx.store.contexts(|contexts| {
            assert_eq!(contexts.casemap(), isupport::CaseMap::ASCII);
        });
    }

    #[test]
    fn kick_self_deactivates_channel() {
        let mut fx = fixture();

        fx.handle(":tern!t@h JOIN #chan");
        fx.handle(":op!o@h KICK #chan tern :begone");

        fx.store.contexts(|contexts| {
            let context = contexts.get("#chan").unwrap();
            assert!(!context.active);
        });
        assert!(fx.lines("#chan").iter().any(|l| l.contains("kicked")));
    }

    #[test]
    fn error_is_fatal() {
        let mut fx = fixture();

        let message = parse::message("ERROR :Closing Link: flood\r\n").unwrap();
        assert!(matches!(
            fx.router.handle(&message, &fx.store, &fx.bus),
            Err(Error::Remote(_))
        ));
    }

    #[test]
    fn unknown_numeric_lands_in_status() {
        let mut fx = fixture();

        fx.handle(":irc.test 742 tern #chan q :MODE cannot be set due to channel having an active MLOCK restriction policy");

        assert!(!fx.lines("status").is_empty());
        assert!(fx.lines("status")[0].contains("MLOCK"));
    }

    #[test]
    fn quit_removes_user_everywhere() {
        let mut fx = fixture();

        fx.handle(":irc.test 353 tern = #a :bob");
        fx.handle(":irc.test 366 tern #a :End");

        fx.handle(":bob!b@h QUIT :gone");

        fx.store.contexts(|contexts| {
            assert!(!contexts.get("#a").unwrap().has_user("bob"));
        });
        assert!(fx.lines("#a").iter().any(|l| l.contains("has quit")));
    }
}

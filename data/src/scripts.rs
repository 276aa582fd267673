use std::collections::HashMap;
use std::sync::Arc;

use crate::event::{self, Bus, Event, Subscription};

/// A command exposed by a script: `{name, aliases, help, handler}`.
/// Invocation routing lives in the command surface; the registry only
/// guarantees unique, case-insensitive names.
#[derive(Clone)]
pub struct Command {
    pub name: String,
    pub aliases: Vec<String>,
    pub help: String,
    pub handler: Arc<dyn Fn(&str) + Send + Sync>,
}

/// Registration boundary consumed by the scripting layer: (event-name,
/// handler) pairs delegate to the bus; (command-name, handler, help)
/// triples land in the command table.
#[derive(Default)]
pub struct Registry {
    commands: HashMap<String, Command>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_event<F>(&self, bus: &Bus, event: &str, handler: F) -> Subscription
    where
        F: Fn(&Event) -> Result<(), event::Error> + Send + Sync + 'static,
    {
        bus.subscribe(event, handler)
    }

    /// Rejects collisions across both names and aliases,
    /// case-insensitively.
    pub fn register_command(&mut self, command: Command) -> Result<(), Error> {
        let mut keys = vec![command.name.to_lowercase()];
        keys.extend(command.aliases.iter().map(|a| a.to_lowercase()));

        for key in &keys {
            if self.commands.contains_key(key) {
                return Err(Error::Collision(key.clone()));
            }
        }

        for key in keys {
            self.commands.insert(key, command.clone());
        }

        Ok(())
    }

    pub fn unregister_command(&mut self, name: &str) {
        if let Some(command) = self.commands.remove(&name.to_lowercase()) {
            for alias in &command.aliases {
                self.commands.remove(&alias.to_lowercase());
            }
        }
    }

    pub fn find(&self, name: &str) -> Option<&Command> {
        self.commands.get(&name.to_lowercase())
    }

    pub fn commands(&self) -> impl Iterator<Item = &Command> {
        let mut seen = std::collections::HashSet::new();
        self.commands
            .values()
            .filter(move |command| seen.insert(command.name.clone()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("command {0:?} is already registered")]
    Collision(String),
}

#[cfg(test)]
mod test {
    use super::*;

    fn command(name: &str, aliases: &[&str]) -> Command {
        Command {
            name: name.into(),
            aliases: aliases.iter().map(ToString::to_string).collect(),
            help: String::new(),
            handler: Arc::new(|_| {}),
        }
    }

    #[test]
    fn case_insensitive_lookup_and_collision() {
        let mut registry = Registry::new();
        registry.register_command(command("Slap", &["trout"])).unwrap();

        assert!(registry.find("slap").is_some());
        assert!(registry.find("SLAP").is_some());
        assert!(registry.find("TROUT").is_some());

        assert!(matches!(
            registry.register_command(command("SLAP", &[])),
            Err(Error::Collision(_))
        ));
        assert!(matches!(
            registry.register_command(command("other", &["Trout"])),
            Err(Error::Collision(_))
        ));
    }

    #[test]
    fn unregister_removes_aliases() {
        let mut registry = Registry::new();
        registry.register_command(command("slap", &["trout"])).unwrap();
        registry.unregister_command("slap");

        assert!(registry.find("slap").is_none());
        assert!(registry.find("trout").is_none());
    }
}

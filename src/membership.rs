use std::collections::BTreeSet;

const ROLE_PREFIXES: &[char] = &['+', '%', '@', '&', '~', '!'];

/// Joined destinations and observed peers for one connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipSet {
    joined: BTreeSet<String>,
    peers: BTreeSet<String>,
}

impl MembershipSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// A `JOIN` echo. The destination counts as joined only when the actor is us.
    pub fn record_join(&mut self, actor: &str, destination: &str, own_nick: &str) {
        if actor.eq_ignore_ascii_case(own_nick) {
            self.joined.insert(destination.to_string());
        }
        self.peers.insert(actor.to_string());
    }

    /// A `353` names reply. Listed names become known peers; never marks joined.
    pub fn record_names<'a>(&mut self, names: impl IntoIterator<Item = &'a str>) {
        for name in names {
            let name = name.trim_start_matches(ROLE_PREFIXES);
            if !name.is_empty() {
                self.peers.insert(name.to_string());
            }
        }
    }

    pub fn remove_destination(&mut self, destination: &str) {
        self.joined.remove(destination);
    }

    pub fn is_joined(&self, destination: &str) -> bool {
        self.joined.contains(destination)
    }

    pub fn joined(&self) -> Vec<String> {
        self.joined.iter().cloned().collect()
    }

    pub fn peers(&self) -> Vec<String> {
        self.peers.iter().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.joined.is_empty() && self.peers.is_empty()
    }
}

/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Tracks which sessions subscribed to which paths, so a value or
//! connection change can be fanned out without re-walking the tree.

use std::collections::{HashMap, HashSet};

use crate::session::SessionId;

#[derive(Debug, Default)]
pub struct Registry {
    by_path: HashMap<String, HashSet<SessionId>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            by_path: HashMap::new(),
        }
    }

    pub fn subscribe(&mut self, path: impl Into<String>, session: SessionId) {
        self.by_path.entry(path.into()).or_default().insert(session);
    }

    pub fn unsubscribe(&mut self, path: &str, session: SessionId) {
        if let Some(set) = self.by_path.get_mut(path) {
            set.remove(&session);
            if set.is_empty() {
                self.by_path.remove(path);
            }
        }
    }

    /// All sessions subscribed to `path`, if any.
    pub fn subscribers(&self, path: &str) -> Option<&HashSet<SessionId>> {
        self.by_path.get(path)
    }

    /// Drops every subscription for a session that has disconnected.
    /// Walks the whole table since a session may be subscribed to
    /// many paths; entries are collected before removal so we never
    /// mutate `by_path` while iterating its values.
    pub fn drop_session(&mut self, session: SessionId) {
        let mut emptied = Vec::new();
        for (path, sessions) in self.by_path.iter_mut() {
            sessions.remove(&session);
            if sessions.is_empty() {
                emptied.push(path.clone());
            }
        }
        for path in emptied {
            self.by_path.remove(&path);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn subscribe_and_fetch() {
        let mut registry = Registry::new();
        let s1 = SessionId::new_for_test(1);
        let s2 = SessionId::new_for_test(2);
        registry.subscribe("1.2", s1);
        registry.subscribe("1.2", s2);
        let subs = registry.subscribers("1.2").unwrap();
        assert_eq!(2, subs.len());
    }

    #[test]
    fn unsubscribe_removes_empty_entries() {
        let mut registry = Registry::new();
        let s1 = SessionId::new_for_test(1);
        registry.subscribe("1.2", s1);
        registry.unsubscribe("1.2", s1);
        assert!(registry.subscribers("1.2").is_none());
    }

    #[test]
    fn drop_session_reaps_all_its_subscriptions() {
        let mut registry = Registry::new();
        let s1 = SessionId::new_for_test(1);
        let s2 = SessionId::new_for_test(2);
        registry.subscribe("1.2", s1);
        registry.subscribe("1.2", s2);
        registry.subscribe("1.3", s1);
        registry.drop_session(s1);
        assert_eq!(1, registry.subscribers("1.2").unwrap().len());
        assert!(registry.subscribers("1.3").is_none());
    }
}

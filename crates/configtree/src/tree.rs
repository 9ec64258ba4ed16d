//! Ordered configuration tree with transactional apply.
//!
//! Statements are word paths such as `interfaces ethernet eth1 address 10.0.0.5/24`.
//! Every word is a node; siblings keep insertion order and are unique, so a
//! statement can exist at most once. Mutations are recorded as pending changes
//! and pushed to the appliance in one batch by [`ConfigTree::apply`].

use crate::backend::{CommitMode, ConfigBackend, ConfigBatch};
use common::Result;
use indexmap::IndexMap;
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A node of the configuration tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Node {
    children: IndexMap<String, Node>,
}

impl Node {
    /// Get a direct child by name
    pub fn child(&self, name: &str) -> Option<&Node> {
        self.children.get(name)
    }

    /// Iterate over children in insertion order
    pub fn children(&self) -> impl Iterator<Item = (&str, &Node)> {
        self.children.iter().map(|(name, node)| (name.as_str(), node))
    }

    /// Names of the direct children in insertion order
    pub fn child_names(&self) -> impl Iterator<Item = &str> {
        self.children.keys().map(String::as_str)
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// The value of a single-valued node (`default-action reject` -> `reject`)
    pub fn value(&self) -> Option<&str> {
        if self.children.len() != 1 {
            return None;
        }
        self.children
            .iter()
            .next()
            .filter(|(_, child)| child.is_leaf())
            .map(|(name, _)| name.as_str())
    }

    /// All leaf statements below this node, relative to it.
    pub fn statements(&self) -> Vec<Vec<String>> {
        let mut out = Vec::new();
        self.collect_leaves(&mut Vec::new(), &mut out);
        out
    }

    fn collect_leaves(&self, prefix: &mut Vec<String>, out: &mut Vec<Vec<String>>) {
        for (name, child) in &self.children {
            prefix.push(name.clone());
            if child.is_leaf() {
                out.push(prefix.clone());
            } else {
                child.collect_leaves(prefix, out);
            }
            prefix.pop();
        }
    }

    fn get(&self, path: &[String]) -> Option<&Node> {
        path.iter().try_fold(self, |node, word| node.children.get(word))
    }

    /// Insert `path`, returning true when at least one node was created.
    fn insert(&mut self, path: &[String]) -> bool {
        let mut created = false;
        let mut node = self;
        for word in path {
            if !node.children.contains_key(word) {
                created = true;
            }
            node = node.children.entry(word.clone()).or_default();
        }
        created
    }

    fn get_or_insert(&mut self, path: &[String]) -> &mut Node {
        let mut node = self;
        for word in path {
            node = node.children.entry(word.clone()).or_default();
        }
        node
    }

    /// Remove the node at `path`, pruning ancestors left without children.
    fn remove(&mut self, path: &[String]) -> bool {
        match path {
            [] => false,
            [last] => self.children.shift_remove(last).is_some(),
            [first, rest @ ..] => {
                let Some(child) = self.children.get_mut(first) else {
                    return false;
                };
                let removed = child.remove(rest);
                if removed && child.children.is_empty() {
                    self.children.shift_remove(first);
                }
                removed
            }
        }
    }

    fn collect_matches(&self, pattern: &[String], prefix: &mut Vec<String>, out: &mut Vec<Vec<String>>) {
        let Some((first, rest)) = pattern.split_first() else {
            out.push(prefix.clone());
            return;
        };
        for (name, child) in &self.children {
            if first == "*" || first == name {
                prefix.push(name.clone());
                child.collect_matches(rest, prefix, out);
                prefix.pop();
            }
        }
    }
}

/// A pending mutation, kept in the order it was made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Set(Vec<String>),
    Delete(Vec<String>),
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Change::Set(path) => write!(f, "set {}", join_words(path)),
            Change::Delete(path) => write!(f, "delete {}", join_words(path)),
        }
    }
}

/// The appliance configuration as seen by the agent.
pub struct ConfigTree {
    root: Node,
    committed: Node,
    pending: Vec<Change>,
    backend: Arc<dyn ConfigBackend>,
}

impl ConfigTree {
    /// Create an empty tree bound to `backend`
    pub fn new(backend: Arc<dyn ConfigBackend>) -> Self {
        Self {
            root: Node::default(),
            committed: Node::default(),
            pending: Vec::new(),
            backend,
        }
    }

    /// Load a tree from `set ...` lines (the output of `show configuration commands`).
    ///
    /// The loaded statements form the committed baseline; nothing is pending.
    pub fn from_commands(text: &str, backend: Arc<dyn ConfigBackend>) -> Self {
        let mut tree = Self::new(backend);
        let mut loaded = 0usize;
        for line in text.lines() {
            let words = split_words(line);
            match words.split_first() {
                Some((verb, path)) if verb == "set" && !path.is_empty() => {
                    tree.root.insert(path);
                    loaded += 1;
                }
                Some(_) => debug!(line, "Ignoring non-set configuration line"),
                None => {}
            }
        }
        tree.committed = tree.root.clone();
        debug!(statements = loaded, "Loaded running configuration");
        tree
    }

    /// Insert `path` unless it is already present.
    ///
    /// Returns whether an insertion occurred.
    pub fn set(&mut self, path: &str) -> bool {
        let words = split_words(path);
        self.set_words(words)
    }

    /// Word-level variant of [`ConfigTree::set`].
    pub fn set_words(&mut self, words: Vec<String>) -> bool {
        if words.is_empty() || !self.root.insert(&words) {
            return false;
        }
        self.pending.push(Change::Set(words));
        true
    }

    /// Set a single-valued leaf, replacing any previous value.
    pub fn set_value(&mut self, key: &str, value: &str) -> bool {
        let mut words = split_words(key);
        if words.is_empty() {
            return false;
        }

        let node = self.root.get_or_insert(&words);
        if node.value() == Some(value) {
            return false;
        }
        node.children.clear();
        node.children.insert(value.to_string(), Node::default());

        words.push(value.to_string());
        self.pending.push(Change::Set(words));
        true
    }

    /// Remove every subtree matching `pattern`; `*` matches any single word.
    ///
    /// Returns whether anything was removed.
    pub fn delete(&mut self, pattern: &str) -> bool {
        let pattern = split_words(pattern);
        if pattern.is_empty() {
            return false;
        }

        let mut matches = Vec::new();
        self.root.collect_matches(&pattern, &mut Vec::new(), &mut matches);

        let mut removed = false;
        for path in matches {
            if self.root.remove(&path) {
                self.pending.push(Change::Delete(path));
                removed = true;
            }
        }
        removed
    }

    /// Look up the node at `path`
    pub fn get(&self, path: &str) -> Option<&Node> {
        self.root.get(&split_words(path))
    }

    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// Changes not yet applied, in order
    pub fn pending(&self) -> &[Change] {
        &self.pending
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Render the whole tree as ordered `set` statements.
    pub fn commands(&self) -> Vec<String> {
        self.root
            .statements()
            .iter()
            .map(|path| format!("set {}", join_words(path)))
            .collect()
    }

    /// Discard pending changes and return to the last committed state.
    pub fn rollback(&mut self) {
        if !self.pending.is_empty() {
            warn!(discarded = self.pending.len(), "Rolling back uncommitted configuration");
        }
        self.root = self.committed.clone();
        self.pending.clear();
    }

    /// Push all pending changes to the appliance as one batch.
    ///
    /// Returns `Ok(false)` when there was nothing to apply. On failure the
    /// tree is rolled back to the last committed state and the error returned.
    pub async fn apply(&mut self, mode: CommitMode) -> Result<bool> {
        if self.pending.is_empty() {
            debug!("Configuration unchanged, nothing to apply");
            return Ok(false);
        }

        let batch = ConfigBatch {
            commands: self.pending.iter().map(ToString::to_string).collect(),
            mode,
        };

        match self.backend.commit(&batch).await {
            Ok(()) => {
                info!(changes = batch.commands.len(), ?mode, "Configuration committed");
                self.committed = self.root.clone();
                self.pending.clear();
                Ok(true)
            }
            Err(e) => {
                warn!(error = %e, changes = batch.commands.len(), "Configuration commit failed");
                self.rollback();
                Err(e)
            }
        }
    }
}

/// Split a statement into words, honoring single and double quotes.
pub fn split_words(statement: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut in_word = false;

    for c in statement.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '\'' || c == '"' => {
                quote = Some(c);
                in_word = true;
            }
            None if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            None => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}

/// Quote a word when it would not survive [`split_words`] as-is.
pub fn quote_word(word: &str) -> Cow<'_, str> {
    let plain = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:@+,=".contains(c));
    if plain {
        Cow::Borrowed(word)
    } else if word.contains('\'') {
        Cow::Owned(format!("\"{}\"", word))
    } else {
        Cow::Owned(format!("'{}'", word))
    }
}

fn join_words(words: &[String]) -> String {
    words
        .iter()
        .map(|w| quote_word(w))
        .collect::<Vec<_>>()
        .join(" ")
}

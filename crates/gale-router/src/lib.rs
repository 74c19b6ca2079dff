//! gale-router: Zero-dependency Radix Trie route table
//!
//! Single Source of Truth (SSOT) route table used by gale-core. Maps
//! (method, path pattern) pairs to an arbitrary value, typically the name
//! of an externally registered handler.
//!
//! ## Features
//! - O(k) path lookup where k = path length
//! - Static paths: `/users`, `/api/v1/health`
//! - Parameters: `/users/:id`, `/posts/:postId/comments/:commentId`
//! - Wildcards: `/files/*path`, `/static/*` (final segment only)
//! - Last-write-wins on duplicate patterns, removal by exact pattern
//! - Zero external dependencies
//!
//! ## Path Syntax
//! - `:name` - Named parameter (captures one segment)
//! - `*` or `*name` - Wildcard (captures remaining path)
//!
//! ## Priority
//! 1. Exact static match (highest)
//! 2. Parameter match
//! 3. Wildcard match (lowest)
//!
//! ## Example
//! ```
//! use gale_router::Router;
//!
//! let mut router = Router::new();
//! router.insert("GET", "/users", "list_users").unwrap();
//! router.insert("GET", "/users/:id", "show_user").unwrap();
//! router.insert("GET", "/files/*path", "serve_file").unwrap();
//!
//! let m = router.find("GET", "/users/123").unwrap();
//! assert_eq!(m.value, "show_user");
//! assert_eq!(m.params, vec![("id".to_string(), "123".to_string())]);
//! ```

use std::collections::HashMap;
use std::fmt;

/// Pattern rejected at insertion time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertError {
    /// A wildcard segment appeared before the final segment.
    WildcardNotLast,
    /// A parameter segment had no name (`:`).
    EmptyParamName,
}

impl fmt::Display for InsertError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InsertError::WildcardNotLast => write!(f, "wildcard segment must be last"),
            InsertError::EmptyParamName => write!(f, "parameter segment must be named"),
        }
    }
}

impl std::error::Error for InsertError {}

/// Route match result
#[derive(Debug, Clone, PartialEq)]
pub struct Match<T> {
    /// The matched route's value
    pub value: T,
    /// Captured path parameters as (name, value) pairs
    pub params: Vec<(String, String)>,
}

impl<T> Match<T> {
    /// Get params as HashMap for convenient access
    pub fn params_map(&self) -> HashMap<String, String> {
        self.params.iter().cloned().collect()
    }
}

/// Trie node for path segment matching
#[derive(Debug)]
struct Node<T> {
    /// Static children (key = path segment)
    children: HashMap<String, Node<T>>,
    /// Parameter child (:id)
    param_child: Option<Box<ParamNode<T>>>,
    /// Wildcard child (*path)
    wildcard_child: Option<Box<WildcardNode<T>>>,
    /// Value if this is a terminal node
    value: Option<T>,
}

impl<T> Default for Node<T> {
    fn default() -> Self {
        Self {
            children: HashMap::new(),
            param_child: None,
            wildcard_child: None,
            value: None,
        }
    }
}

impl<T> Node<T> {
    fn is_empty(&self) -> bool {
        self.value.is_none()
            && self.children.is_empty()
            && self.param_child.is_none()
            && self.wildcard_child.is_none()
    }
}

#[derive(Debug)]
struct ParamNode<T> {
    name: String,
    node: Node<T>,
}

#[derive(Debug)]
struct WildcardNode<T> {
    name: String,
    value: T,
}

/// Zero-dependency Radix Trie route table
///
/// Routes are organized by HTTP method for O(1) method dispatch,
/// then matched using a radix trie for O(k) path matching.
///
/// Parameter names are not part of a route's identity: `/a/:x` and
/// `/a/:y` occupy the same trie position, so inserting the second
/// replaces the first's value while the first's capture name survives.
#[derive(Debug)]
pub struct Router<T> {
    /// Method -> Trie root
    trees: HashMap<String, Node<T>>,
}

impl<T> Default for Router<T> {
    fn default() -> Self {
        Self {
            trees: HashMap::new(),
        }
    }
}

impl<T> Router<T> {
    /// Create a new router
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a route, returning the value it replaced if the pattern
    /// was already registered (last-write-wins).
    ///
    /// # Arguments
    /// * `method` - HTTP method (GET, POST, etc.)
    /// * `path` - URL path with optional params (:id) and wildcards (*)
    /// * `value` - Value to associate with the route
    ///
    /// # Example
    /// ```
    /// use gale_router::Router;
    ///
    /// let mut router = Router::new();
    /// assert_eq!(router.insert("GET", "/users/:id", 0), Ok(None));
    /// assert_eq!(router.insert("GET", "/users/:id", 1), Ok(Some(0)));
    /// ```
    pub fn insert(&mut self, method: &str, path: &str, value: T) -> Result<Option<T>, InsertError> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        Self::validate(&segments)?;
        let tree = self.trees.entry(method.to_uppercase()).or_default();
        Ok(Self::insert_node(tree, &segments, value))
    }

    fn validate(segments: &[&str]) -> Result<(), InsertError> {
        for (i, segment) in segments.iter().enumerate() {
            if segment.starts_with('*') && i + 1 != segments.len() {
                return Err(InsertError::WildcardNotLast);
            }
            if *segment == ":" {
                return Err(InsertError::EmptyParamName);
            }
        }
        Ok(())
    }

    fn insert_node(node: &mut Node<T>, segments: &[&str], value: T) -> Option<T> {
        if segments.is_empty() {
            return node.value.replace(value);
        }

        let segment = segments[0];
        let rest = &segments[1..];

        if let Some(name) = segment.strip_prefix(':') {
            // Parameter segment (:id, :userId, etc.); first registration
            // fixes the capture name for this position.
            let param = node.param_child.get_or_insert_with(|| {
                Box::new(ParamNode {
                    name: name.to_string(),
                    node: Node::default(),
                })
            });
            Self::insert_node(&mut param.node, rest, value)
        } else if let Some(name) = segment.strip_prefix('*') {
            // Wildcard segment (*path or bare *), always terminal
            let wildcard_name = if name.is_empty() { "*" } else { name };
            match node.wildcard_child.as_mut() {
                Some(wildcard) => Some(std::mem::replace(&mut wildcard.value, value)),
                None => {
                    node.wildcard_child = Some(Box::new(WildcardNode {
                        name: wildcard_name.to_string(),
                        value,
                    }));
                    None
                }
            }
        } else {
            // Static segment
            let child = node.children.entry(segment.to_string()).or_default();
            Self::insert_node(child, rest, value)
        }
    }

    /// Remove a route by its exact registered pattern, returning its value.
    ///
    /// Removal is keyed on pattern shape, not parameter spelling:
    /// `remove("GET", "/users/:uid")` removes a route registered as
    /// `/users/:id`. Emptied trie branches are pruned. Returns `None`
    /// when no route was registered under the pattern.
    ///
    /// # Example
    /// ```
    /// use gale_router::Router;
    ///
    /// let mut router = Router::new();
    /// router.insert("GET", "/users/:id", 7).unwrap();
    /// assert_eq!(router.remove("GET", "/users/:id"), Some(7));
    /// assert_eq!(router.remove("GET", "/users/:id"), None);
    /// assert!(router.find("GET", "/users/42").is_none());
    /// ```
    pub fn remove(&mut self, method: &str, path: &str) -> Option<T> {
        let method = method.to_uppercase();
        let tree = self.trees.get_mut(&method)?;
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let removed = Self::remove_node(tree, &segments);
        if removed.is_some() && tree.is_empty() {
            self.trees.remove(&method);
        }
        removed
    }

    fn remove_node(node: &mut Node<T>, segments: &[&str]) -> Option<T> {
        if segments.is_empty() {
            return node.value.take();
        }

        let segment = segments[0];
        let rest = &segments[1..];

        if segment.starts_with(':') {
            let param = node.param_child.as_mut()?;
            let removed = Self::remove_node(&mut param.node, rest);
            if removed.is_some() && param.node.is_empty() {
                node.param_child = None;
            }
            removed
        } else if segment.starts_with('*') {
            node.wildcard_child.take().map(|wildcard| wildcard.value)
        } else {
            let child = node.children.get_mut(segment)?;
            let removed = Self::remove_node(child, rest);
            if removed.is_some() && child.is_empty() {
                node.children.remove(segment);
            }
            removed
        }
    }

    /// Find a matching route
    ///
    /// # Arguments
    /// * `method` - HTTP method
    /// * `path` - URL path to match
    ///
    /// # Returns
    /// `Some(Match)` with the route's value and captured params, or `None`
    /// if no match
    ///
    /// # Example
    /// ```
    /// use gale_router::Router;
    ///
    /// let mut router = Router::new();
    /// router.insert("GET", "/users/:id", "show_user").unwrap();
    ///
    /// let m = router.find("GET", "/users/42").unwrap();
    /// assert_eq!(m.value, "show_user");
    /// assert_eq!(m.params[0], ("id".to_string(), "42".to_string()));
    /// ```
    pub fn find(&self, method: &str, path: &str) -> Option<Match<T>>
    where
        T: Clone,
    {
        let tree = self.trees.get(&method.to_uppercase())?;
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let mut params = Vec::new();
        Self::find_node(tree, &segments, &mut params)
    }

    fn find_node(
        node: &Node<T>,
        segments: &[&str],
        params: &mut Vec<(String, String)>,
    ) -> Option<Match<T>>
    where
        T: Clone,
    {
        if segments.is_empty() {
            return node.value.as_ref().map(|value| Match {
                value: value.clone(),
                params: params.clone(),
            });
        }

        let segment = segments[0];
        let rest = &segments[1..];

        // Priority 1: Try exact static match (highest priority)
        if let Some(child) = node.children.get(segment) {
            if let Some(m) = Self::find_node(child, rest, params) {
                return Some(m);
            }
        }

        // Priority 2: Try parameter match
        if let Some(ref param) = node.param_child {
            params.push((param.name.clone(), segment.to_string()));
            if let Some(m) = Self::find_node(&param.node, rest, params) {
                return Some(m);
            }
            params.pop();
        }

        // Priority 3: Try wildcard match (lowest priority, captures everything)
        if let Some(ref wildcard) = node.wildcard_child {
            let rest_path = segments.join("/");
            params.push((wildcard.name.clone(), rest_path));
            return Some(Match {
                value: wildcard.value.clone(),
                params: params.clone(),
            });
        }

        None
    }
}

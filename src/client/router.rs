//! Hash-fragment navigation state
//!
//! Location is kept as `#section/subsection/extra...`. The section picks a
//! top-level area, the subsection a view within it, and any remaining
//! segments are free-form extras (modal targets such as `#samples/list/create`).

use std::collections::BTreeMap;

use crate::shared::event::{Emitter, ListenerId};

pub const LANDING_SECTION: &str = "home";
pub const LANDING_SUBSECTION: &str = "welcome";

/// Parsed location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub section: String,
    pub subsection: String,
    pub extra: Vec<String>,
}

impl Route {
    pub fn landing() -> Self {
        Self {
            section: LANDING_SECTION.to_string(),
            subsection: LANDING_SUBSECTION.to_string(),
            extra: Vec::new(),
        }
    }

    pub fn to_hash(&self) -> String {
        let mut hash = format!("#{}/{}", self.section, self.subsection);
        for segment in &self.extra {
            hash.push('/');
            hash.push_str(segment);
        }
        hash
    }
}

/// Known sections and their default subsections
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTable {
    defaults: BTreeMap<String, String>,
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::empty()
            .with(LANDING_SECTION, LANDING_SUBSECTION)
            .with("jobs", "list")
            .with("samples", "list")
            .with("viruses", "list")
            .with("history", "list")
            .with("indexes", "list")
            .with("hmm", "list")
            .with("subtraction", "list")
            .with("settings", "general")
            .with("account", "general")
            .with("administration", "users")
    }
}

impl RouteTable {
    pub fn empty() -> Self {
        Self {
            defaults: BTreeMap::from([(
                LANDING_SECTION.to_string(),
                LANDING_SUBSECTION.to_string(),
            )]),
        }
    }

    pub fn with(mut self, section: &str, default_subsection: &str) -> Self {
        self.defaults
            .insert(section.to_string(), default_subsection.to_string());
        self
    }

    pub fn default_subsection(&self, section: &str) -> Option<&str> {
        self.defaults.get(section).map(String::as_str)
    }

    /// Resolve a hash fragment. Unknown sections land on `home/welcome`.
    pub fn resolve(&self, hash: &str) -> Route {
        let mut segments = hash
            .trim_start_matches('#')
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        let Some(section) = segments.next() else {
            return Route::landing();
        };
        let Some(default) = self.default_subsection(&section) else {
            tracing::warn!(section = %section, "Unknown route section");
            return Route::landing();
        };
        let subsection = segments.next().unwrap_or_else(|| default.to_string());
        Route {
            section,
            subsection,
            extra: segments.collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterEventKind {
    Change,
}

#[derive(Debug)]
pub struct Router {
    table: RouteTable,
    route: Route,
    events: Emitter<RouterEventKind, Route>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new(RouteTable::default())
    }
}

impl Router {
    pub fn new(table: RouteTable) -> Self {
        Self {
            table,
            route: Route::landing(),
            events: Emitter::new(),
        }
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    pub fn to_hash(&self) -> String {
        self.route.to_hash()
    }

    /// Move to `hash`. Returns whether the location changed.
    pub fn navigate(&mut self, hash: &str) -> bool {
        let route = self.table.resolve(hash);
        self.replace(route)
    }

    pub fn set_extra<I, S>(&mut self, segments: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut route = self.route.clone();
        route.extra = segments.into_iter().map(Into::into).collect();
        self.replace(route)
    }

    pub fn clear_extra(&mut self) -> bool {
        self.set_extra(Vec::<String>::new())
    }

    /// Return to the landing route
    pub fn reset(&mut self) -> bool {
        self.replace(Route::landing())
    }

    pub fn on<F>(&mut self, kind: RouterEventKind, handler: F) -> ListenerId
    where
        F: FnMut(&Route) + Send + 'static,
    {
        self.events.on(kind, handler)
    }

    pub fn off(&mut self, id: ListenerId) -> bool {
        self.events.off(id)
    }

    fn replace(&mut self, route: Route) -> bool {
        if route == self.route {
            return false;
        }
        tracing::debug!(hash = %route.to_hash(), "Route changed");
        self.route = route;
        self.events.emit(RouterEventKind::Change, &self.route);
        true
    }
}

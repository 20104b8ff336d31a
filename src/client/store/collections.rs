//! Built-in collections
//!
//! The collections the server publishes to every client. Retained
//! collections are persisted locally and synced by manifest; the rest are
//! refetched in full on every connection.

use super::CollectionDefinition;

/// Definitions for every collection the client mirrors
pub fn default_collections() -> Vec<CollectionDefinition> {
    vec![
        CollectionDefinition::new("jobs")
            .indexed(&["task", "state", "user.id"])
            .retained(true),
        CollectionDefinition::new("samples")
            .unique(&["name"])
            .indexed(&["user.id", "group"])
            .retained(true),
        CollectionDefinition::new("analyses")
            .indexed(&["sample.id", "algorithm"])
            .retained(true),
        CollectionDefinition::new("viruses")
            .unique(&["name"])
            .indexed(&["abbreviation", "modified"])
            .retained(true),
        CollectionDefinition::new("history")
            .indexed(&["virus.id", "index.id", "index.version"])
            .retained(true),
        CollectionDefinition::new("indexes")
            .unique(&["index_version"])
            .retained(true),
        CollectionDefinition::new("hmm")
            .indexed(&["families"])
            .retained(true),
        CollectionDefinition::new("files").indexed(&["type"]),
        CollectionDefinition::new("users").indexed(&["groups"]),
        CollectionDefinition::new("groups"),
    ]
}

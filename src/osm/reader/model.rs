// (c) Copyright 2025 Mikołaj Kuranowski
// SPDX-License-Identifier: MIT

use std::collections::HashMap;

use crate::Node;

/// Represents an [OSM way](https://wiki.openstreetmap.org/wiki/Way).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Way {
    pub id: i64,
    pub nodes: Vec<i64>,
    pub tags: HashMap<String, String>,
}

/// Union over the [OSM features/elements](https://wiki.openstreetmap.org/wiki/Elements)
/// relevant for building a road network. Relations are not decoded.
#[derive(Debug, Clone)]
pub enum Feature {
    Node(Node),
    Way(Way),
}

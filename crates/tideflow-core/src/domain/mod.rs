/// Process definitions: activity graph, flows and validation
pub mod process_definition;

/// Activity instance lifecycle
pub mod activity_instance;

/// Workflow instance aggregate
pub mod workflow_instance;

/// Commands emitted by activity decision logic
pub mod command;

/// Decision and successor logic per activity kind
pub mod catalog;

/// Domain events
pub mod events;

/// Collaborator contracts
pub mod repository;

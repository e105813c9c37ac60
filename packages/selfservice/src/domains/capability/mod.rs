// Capability domain - collaborator surface only.
//
// The full capability domain (creation, AWS accounts, Kafka topics, ...)
// lives elsewhere; this crate only needs to know that capabilities exist and
// who their members are.

pub mod models;

//! Integration tests for the harvester
//!
//! These tests run real engine tasks against a wiremock stand-in for the
//! upstream, with the database and output files in a temporary directory.

mod common;
mod harvest_tests;
mod pool_tests;

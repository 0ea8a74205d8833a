// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Lifecycle management for Solr instances and shards.
//!
//! The crate installs a Solr binary distribution once per shared install
//! root, lays out a runtime directory per instance from a shared Solr home,
//! supervises the instance's JVM and coordinates operations that span a
//! sharded cluster: configuration uploads to ZooKeeper, core reloads, index
//! optimization and offline index upgrades.
//!
//! [`ops::Operations`] ties the components together and is what the
//! `mc-solr` binary drives.

pub mod archive;
pub mod cluster;
pub mod command;
pub mod config;
pub mod dist;
pub mod error;
pub mod files;
pub mod home;
pub mod instance;
pub mod java;
pub mod layout;
pub mod net;
pub mod ops;
pub mod supervisor;
pub mod topology;
pub mod zookeeper;

pub use crate::error::{Error, Result};

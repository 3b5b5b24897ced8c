// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of wandersphere.
//
// wandersphere is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// wandersphere is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with wandersphere.  If not,
// see <http://www.gnu.org/licenses/>.

//! # wandersphere
//!
//! A small social-media backend: users register & log in, create posts, follow one another, like
//! & comment, and read a personalized newsfeed assembled by fan-out-on-write. Four daemons share
//! this library crate: the authoring service (`authpostd`), the newsfeed publisher
//! (`nfpublishd`), the newsfeed reader (`newsfeedd`) & the HTTP gateway (`webappd`).

pub mod authpost;
pub mod bootstrap;
pub mod cache;
pub mod client;
pub mod config;
pub mod entities;
pub mod eventlog;
#[path = "friends-api.rs"]
pub mod friends_api;
pub mod gateway;
pub mod metrics;
pub mod newsfeed;
#[path = "newsfeed-api.rs"]
pub mod newsfeed_api;
pub mod postgres;
#[path = "posts-api.rs"]
pub mod posts_api;
pub mod publisher;
pub mod rpc;
pub mod session;
pub mod storage;
#[path = "users-api.rs"]
pub mod users_api;

// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![warn(missing_docs, rust_2018_idioms)]
// Disallow warnings in examples.
#![doc(test(attr(deny(warnings))))]

//! nproxy is a multi-process, event-driven HTTP/1.1 reverse proxy and
//! static file server.
//!
//! A master process binds the listening sockets and forks workers; each
//! worker is a single-threaded reactor over edge-triggered sockets with a
//! per-connection state machine spanning request parsing, response
//! emission, upstream proxying, tunneling, and zero-copy file
//! transmission. Nothing is shared between workers except the kernel's
//! SO_REUSEPORT accept queues.

pub mod arena;
pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod logging;
pub mod master;
pub mod net;
pub mod parser;
pub mod proxy;
pub mod reactor;
pub mod signal;
pub mod timeout;
pub mod tls;
pub mod worker;

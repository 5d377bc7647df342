// Callback-driven I/O multiplexer for non-blocking TCP services.
//
// SPDX-License-Identifier: Apache-2.0
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not use this file except
// in compliance with the License. You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software distributed under the License
// is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express
// or implied. See the License for the specific language governing permissions and limitations under
// the License.

//! Non-blocking TCP sockets speaking the runtime's callback contract.

pub mod addr;
pub(crate) mod sys;
pub mod tcp_client;
pub mod tcp_server;

pub use addr::{Family, InetAddress};
pub use tcp_client::{Connecting, TcpClient};
pub use tcp_server::TcpServer;

use crate::status::Result;

/// Completion callback carrying only success or failure.
pub type StatusCallback = Box<dyn FnOnce(Result<()>) + Send>;

/// Completion callback carrying a byte count (zero meaning EOF on reads).
pub type IoCallback = Box<dyn FnOnce(Result<usize>) + Send>;

/// Completion callback for accepts, carrying the accepted client and its
/// peer address.
pub type AcceptCallback = Box<dyn FnOnce(Result<(TcpClient, InetAddress)>) + Send>;

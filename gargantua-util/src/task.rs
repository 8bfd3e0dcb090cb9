// Copyright 2025 The Gargantua Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Task spawning for long-running loops such as informers, controller
//! workers and the leader elector.

use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};

use tokio::task::{JoinError, JoinHandle};
#[doc(hidden)]
pub use tracing::error_span as __error_span;
use tracing::{Instrument, Span};

#[doc(hidden)]
pub fn __spawn_guarded<F, T>(future: F, span: Span) -> JoinHandleDropGuard<T>
where
    T: Send + 'static,
    F: Future<Output = T> + Send + 'static,
{
    JoinHandleDropGuard::new(tokio::spawn(future.instrument(span)))
}

/// Spawns `$fut` inside an error span named `$name` (plus any extra span
/// fields) and returns a [`JoinHandleDropGuard`]. Dropping the guard aborts
/// the task.
#[macro_export]
macro_rules! spawn {
    ($name:expr, $fut:expr $(,)?) => {{
        $crate::task::__spawn_guarded($fut, $crate::task::__error_span!($name))
    }};
    ($name:expr, $fut:expr, $($fields:tt)*) => {{
        $crate::task::__spawn_guarded($fut, $crate::task::__error_span!($name, $($fields)*))
    }};
}

/// Aborts the task it wraps when dropped, so a controller that goes away
/// takes its workers with it.
#[derive(Debug)]
#[must_use]
pub struct JoinHandleDropGuard<T> {
    inner: JoinHandle<T>,
}

impl<T> JoinHandleDropGuard<T> {
    pub const fn new(inner: JoinHandle<T>) -> Self {
        Self { inner }
    }
}

impl<T> Future for JoinHandleDropGuard<T> {
    type Output = Result<T, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.inner).poll(cx)
    }
}

impl<T> Drop for JoinHandleDropGuard<T> {
    fn drop(&mut self) {
        self.inner.abort();
    }
}

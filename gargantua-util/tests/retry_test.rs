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

use core::future::Future;
use core::pin::Pin;
use core::sync::atomic::{AtomicI32, Ordering};
use core::time::Duration;
use std::sync::Arc;

use futures::future::ready;
use gargantua_config::queues::Retry;
use gargantua_error::{Code, Error, make_err};
use gargantua_macro::gargantua_test;
use gargantua_util::retry::{Retrier, RetryResult};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;

type SleepFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

fn instant_retrier(max_retries: usize) -> Retrier {
    Retrier::new(
        Arc::new(|_duration: Duration| -> SleepFuture { Box::pin(ready(())) }),
        Arc::new(|delay: Duration| delay),
        Retry {
            max_retries,
            ..Default::default()
        },
    )
}

#[gargantua_test]
async fn retry_simple_success() -> Result<(), Error> {
    let retrier = instant_retrier(4);
    let run_count = AtomicI32::new(0);

    let result = retrier
        .retry(|| {
            run_count.fetch_add(1, Ordering::Relaxed);
            ready(RetryResult::Ok(true))
        })
        .await?;
    assert_eq!(run_count.load(Ordering::Relaxed), 1);
    assert!(result);
    Ok(())
}

#[gargantua_test]
async fn retry_gives_up_after_max_retries() -> Result<(), Error> {
    let retrier = instant_retrier(2);
    let run_count = AtomicI32::new(0);

    let result = retrier
        .retry(|| {
            run_count.fetch_add(1, Ordering::Relaxed);
            ready(RetryResult::<bool>::Retry(make_err!(
                Code::Aborted,
                "version conflict"
            )))
        })
        .await;
    assert_eq!(run_count.load(Ordering::Relaxed), 3);
    let error = result.unwrap_err();
    assert_eq!(error.code, Code::Aborted);
    assert_eq!(
        error.messages,
        vec![
            "version conflict".to_string(),
            "Giving up after attempt 3".to_string()
        ]
    );
    Ok(())
}

#[gargantua_test]
async fn permanent_error_stops_immediately() -> Result<(), Error> {
    let retrier = instant_retrier(4);
    let run_count = AtomicI32::new(0);

    let result = retrier
        .retry(|| {
            run_count.fetch_add(1, Ordering::Relaxed);
            ready(RetryResult::<()>::Err(make_err!(Code::NotFound, "gone")))
        })
        .await;
    assert_eq!(run_count.load(Ordering::Relaxed), 1);
    assert_eq!(result.unwrap_err().code, Code::NotFound);
    Ok(())
}

#[gargantua_test]
async fn backoff_doubles_from_base_delay() -> Result<(), Error> {
    let sleeps = Arc::new(Mutex::new(Vec::new()));
    let recorded = sleeps.clone();
    let retrier = Retrier::new(
        Arc::new(move |duration: Duration| -> SleepFuture {
            recorded.lock().push(duration);
            Box::pin(ready(()))
        }),
        Arc::new(|delay: Duration| delay),
        Retry {
            max_retries: 3,
            delay: 10.0,
            jitter: 0.0,
        },
    );
    let run_count = AtomicI32::new(0);

    let result = retrier
        .retry(|| {
            let attempt = run_count.fetch_add(1, Ordering::Relaxed);
            ready(if attempt < 2 {
                RetryResult::Retry(make_err!(Code::Aborted, "conflict"))
            } else {
                RetryResult::Ok(attempt)
            })
        })
        .await?;
    assert_eq!(result, 2);
    assert_eq!(
        *sleeps.lock(),
        vec![Duration::from_millis(20), Duration::from_millis(40)]
    );
    Ok(())
}

#[test]
fn jitter_stays_within_bounds() {
    let jitter = Retrier::jitter_fn(1.0);
    for _ in 0..100 {
        let delay = jitter(Duration::from_millis(100));
        assert!(delay >= Duration::from_millis(50) && delay <= Duration::from_millis(150));
    }
    let none = Retrier::jitter_fn(0.0);
    assert_eq!(none(Duration::from_millis(100)), Duration::from_millis(100));
}

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

//! Time formats stored in resource specs.

use core::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use gargantua_error::{Error, ResultExt, make_input_err};

/// `Mon Jan  2 15:04:05 UTC 2006`. The zone name is ignored on parse and
/// the time is taken as UTC.
const UNIX_DATE: &str = "%a %b %e %H:%M:%S %Z %Y";

pub fn parse_unix_date(value: &str) -> Result<DateTime<Utc>, Error> {
    NaiveDateTime::parse_from_str(value.trim(), UNIX_DATE)
        .map(|naive| naive.and_utc())
        .err_tip(|| format!("parsing {value:?} as a unix date"))
}

pub fn format_unix_date(value: DateTime<Utc>) -> String {
    value.format("%a %b %e %H:%M:%S UTC %Y").to_string()
}

/// Durations such as `5m`, `2h` or `1h30m`. Empty means unset.
pub fn parse_duration(value: &str) -> Result<Option<Duration>, Error> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(None);
    }
    humantime::parse_duration(value)
        .map(Some)
        .map_err(|e| make_input_err!("invalid duration {value:?}: {e}"))
}

#[cfg(test)]
mod tests {
    use core::time::Duration;

    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;

    use super::{format_unix_date, parse_duration, parse_unix_date};

    #[test]
    fn unix_date_round_trips() {
        let when = Utc.with_ymd_and_hms(2025, 3, 7, 9, 5, 0).unwrap();
        let text = format_unix_date(when);
        assert_eq!(text, "Fri Mar  7 09:05:00 UTC 2025");
        assert_eq!(parse_unix_date(&text).unwrap(), when);
    }

    #[test]
    fn unix_date_rejects_garbage() {
        let error = parse_unix_date("tomorrow").unwrap_err();
        assert_eq!(error.code, gargantua_error::Code::InvalidArgument);
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration("").unwrap(), None);
        assert_eq!(parse_duration("5m").unwrap(), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration("1h30m").unwrap(), Some(Duration::from_secs(5400)));
        assert!(parse_duration("soon").is_err());
    }
}

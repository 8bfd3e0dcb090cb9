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

use gargantua_error::{Code, Error, ResultExt, error_if, make_err, make_input_err};
use pretty_assertions::assert_eq;
use serde::de::Error as DeError;

#[test]
fn deserialization_error_is_invalid_argument() {
    let error = <Error as DeError>::custom("missing field `count`");
    assert_eq!(error.code, Code::InvalidArgument);
    assert_eq!(error.messages, vec!["missing field `count`".to_string()]);
}

#[test]
fn json_decode_error_is_data_loss() {
    let result: Result<serde_json::Value, _> = serde_json::from_str("{not json");
    let error: Error = result.unwrap_err().into();
    assert_eq!(error.code, Code::DataLoss);
    assert!(error.is_permanent());
}

#[test]
fn err_tip_keeps_code_and_appends_message() {
    let result: Result<(), Error> = Err(make_err!(Code::Aborted, "version 3 != 4"));
    let error = result.err_tip(|| "while updating vm-1").unwrap_err();
    assert_eq!(error.code, Code::Aborted);
    assert_eq!(
        error.messages,
        vec!["version 3 != 4".to_string(), "while updating vm-1".to_string()]
    );
    assert!(!error.is_permanent());
}

#[test]
fn err_tip_on_none_defaults_to_internal() {
    let value: Option<u32> = None;
    let error = value.err_tip(|| "no replicas").unwrap_err();
    assert_eq!(error.code, Code::Internal);
    assert_eq!(error.message_string(), "no replicas");
}

#[test]
fn err_tip_with_code_overrides_code() {
    let value: Option<u32> = None;
    let error = value
        .err_tip_with_code(|_| (Code::NotFound, "vm missing"))
        .unwrap_err();
    assert_eq!(error.code, Code::NotFound);
}

#[test]
fn error_if_returns_invalid_argument() {
    fn check(count: u32) -> Result<(), Error> {
        error_if!(count == 0, "count must be positive, got {count}");
        Ok(())
    }
    assert_eq!(check(1), Ok(()));
    let error = check(0).unwrap_err();
    assert_eq!(error.code, Code::InvalidArgument);
    assert_eq!(error.message_string(), "count must be positive, got 0");
}

#[test]
fn merge_separates_messages() {
    let first = make_input_err!("first");
    let second = make_err!(Code::Internal, "second");
    let merged = first.merge(second);
    assert_eq!(merged.code, Code::InvalidArgument);
    assert_eq!(
        merged.messages,
        vec!["first".to_string(), "---".to_string(), "second".to_string()]
    );
}

#[test]
fn tonic_status_round_trip_preserves_code() {
    let status: tonic::Status = make_err!(Code::Unavailable, "cache not synced").into();
    assert_eq!(status.code(), tonic::Code::Unavailable);
    assert_eq!(status.message(), "cache not synced");
    let error: Error = status.into();
    assert_eq!(error.code, Code::Unavailable);
}

#[test]
fn code_from_unknown_integer_is_unknown() {
    assert_eq!(Code::from(10), Code::Aborted);
    assert_eq!(Code::from(99), Code::Unknown);
}

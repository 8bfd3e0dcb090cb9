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

//! Version conversion of stored documents.
//!
//! `User`: v1 carries `spec.admin`, v2 does not. `Scenario`: v2 carries
//! `spec.vm_tasks`, v1 does not. Both directions are lossy: a scenario
//! going v2 -> v1 -> v2 comes back with an empty `vm_tasks`.

use gargantua_error::{Error, ResultExt, make_input_err};
use serde_json::{Map, Value};

use crate::GROUP;

pub const V1: &str = "v1";
pub const V2: &str = "v2";

fn api_version(version: &str) -> String {
    format!("{GROUP}/{version}")
}

fn spec_mut<'a>(doc: &'a mut Value, kind: &str) -> Result<&'a mut Map<String, Value>, Error> {
    let object = doc
        .as_object_mut()
        .err_tip(|| format!("{kind} document is not an object"))?;
    let spec = object
        .entry("spec")
        .or_insert_with(|| Value::Object(Map::new()));
    spec.as_object_mut()
        .err_tip(|| format!("{kind} spec is not an object"))
}

fn set_api_version(doc: &mut Value, version: &str) {
    if let Some(object) = doc.as_object_mut() {
        object.insert("apiVersion".to_string(), Value::String(api_version(version)));
    }
}

pub fn user_v1_to_v2(mut doc: Value) -> Result<Value, Error> {
    spec_mut(&mut doc, "User")?.remove("admin");
    set_api_version(&mut doc, V2);
    Ok(doc)
}

pub fn user_v2_to_v1(mut doc: Value) -> Result<Value, Error> {
    spec_mut(&mut doc, "User")?.insert("admin".to_string(), Value::Bool(false));
    set_api_version(&mut doc, V1);
    Ok(doc)
}

pub fn scenario_v1_to_v2(mut doc: Value) -> Result<Value, Error> {
    spec_mut(&mut doc, "Scenario")?.insert("vm_tasks".to_string(), Value::Array(Vec::new()));
    set_api_version(&mut doc, V2);
    Ok(doc)
}

pub fn scenario_v2_to_v1(mut doc: Value) -> Result<Value, Error> {
    spec_mut(&mut doc, "Scenario")?.remove("vm_tasks");
    set_api_version(&mut doc, V1);
    Ok(doc)
}

/// Converts `doc` of `kind` to `desired_version`. Documents already at that
/// version are returned unchanged.
pub fn convert(kind: &str, doc: Value, desired_version: &str) -> Result<Value, Error> {
    let current = doc
        .get("apiVersion")
        .and_then(Value::as_str)
        .and_then(|v| v.strip_prefix(&format!("{GROUP}/")))
        .err_tip(|| format!("{kind} document has no {GROUP} apiVersion"))?
        .to_string();
    if current == desired_version {
        return Ok(doc);
    }
    match (kind, current.as_str(), desired_version) {
        ("User", V1, V2) => user_v1_to_v2(doc),
        ("User", V2, V1) => user_v2_to_v1(doc),
        ("Scenario", V1, V2) => scenario_v1_to_v2(doc),
        ("Scenario", V2, V1) => scenario_v2_to_v1(doc),
        _ => Err(make_input_err!(
            "no conversion for {kind} from {current} to {desired_version}"
        )),
    }
}

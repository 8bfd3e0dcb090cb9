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

//! Translates a VM into the records the infrastructure executor consumes,
//! and the executor's outputs back into VM status.

use std::collections::BTreeMap;

use gargantua_error::{Code, Error, ResultExt, make_err, make_input_err};
use gargantua_resources::terraform::{TfOutputs, TfStateSpec, TfVariables};
use gargantua_resources::{
    ConfigMap, Environment, ObjectMeta, Secret, TfExecution, TfState, VirtualMachine,
    Resource, VirtualMachineTemplate, labels,
};
use gargantua_store::{Api, Lister};
use gargantua_util::labels::LabelSelector;
use gargantua_util::names::{rand32, random_alphanumeric};
use tracing::debug;

use crate::keypair::KeyPair;

pub const SHELL_ENDPOINT_PLACEHOLDER: &str = "$_SHELL_ENDPOINT_$";
pub const CLOUD_CONFIG_KEY: &str = "cloud-config";
pub const IMAGE_KEY: &str = "image";
pub const MODULE_KEY: &str = "module";
pub const EXECUTOR_IMAGE_KEY: &str = "executor_image";
pub const CRED_SECRET_KEY: &str = "cred_secret";

const PASSWORD_LENGTH: usize = 16;

/// Provisioning configuration of `vm`: the template's config, overlaid with
/// the environment specifics, overlaid with the environment's mapping for
/// the template. Fails with `InvalidArgument` if the environment does not
/// map the template or a required key is missing.
pub fn resolve_config(
    template: &VirtualMachineTemplate,
    environment: &Environment,
    ws_endpoint: &str,
) -> Result<BTreeMap<String, String>, Error> {
    let template_id = &template.metadata.name;
    let mapping = environment
        .spec
        .template_mapping
        .get(template_id)
        .ok_or_else(|| {
            make_input_err!(
                "Environment {} does not map template {template_id}",
                environment.metadata.name
            )
        })?;

    let mut config = template.spec.config_map.clone();
    config.extend(
        environment
            .spec
            .environment_specifics
            .iter()
            .map(|(k, v)| (k.clone(), v.clone())),
    );
    config.extend(mapping.iter().map(|(k, v)| (k.clone(), v.clone())));

    if let Some(cloud_config) = config.get_mut(CLOUD_CONFIG_KEY) {
        *cloud_config = cloud_config.replace(SHELL_ENDPOINT_PLACEHOLDER, ws_endpoint);
    }

    for key in [IMAGE_KEY, MODULE_KEY, EXECUTOR_IMAGE_KEY] {
        if config.get(key).is_none_or(|value| value.is_empty()) {
            return Err(make_input_err!(
                "Provisioning config for template {template_id} in environment {} has no {key}",
                environment.metadata.name
            ));
        }
    }
    Ok(config)
}

const SECRET_HANDLE: &str = "secret:";
const CONFIG_MAP_HANDLE: &str = "configmap:";

fn split_handle<'a>(key: &str, handle: &'a str) -> Result<(&'a str, &'a str), Error> {
    handle
        .split_once(':')
        .filter(|(name, field)| !name.is_empty() && !field.is_empty())
        .ok_or_else(|| make_input_err!("Config value of {key} is not a <name>:<field> handle"))
}

/// Replaces `secret:<name>:<field>` and `configmap:<name>:<field>` values
/// with the referenced field. A handle whose object or field is missing
/// is `InvalidArgument`.
pub async fn resolve_handles(
    mut config: BTreeMap<String, String>,
    config_maps: &Api<ConfigMap>,
    secrets: &Api<Secret>,
) -> Result<BTreeMap<String, String>, Error> {
    for (key, value) in &mut config {
        let resolved = if let Some(handle) = value.strip_prefix(SECRET_HANDLE) {
            let (name, field) = split_handle(key, handle)?;
            let secret = secrets
                .get_opt(name)
                .await?
                .ok_or_else(|| make_input_err!("Secret {name} referenced by {key} not found"))?;
            secret.string_data.get(field).cloned().ok_or_else(|| {
                make_input_err!("Secret {name} referenced by {key} has no field {field}")
            })?
        } else if let Some(handle) = value.strip_prefix(CONFIG_MAP_HANDLE) {
            let (name, field) = split_handle(key, handle)?;
            let config_map = config_maps.get_opt(name).await?.ok_or_else(|| {
                make_input_err!("Config map {name} referenced by {key} not found")
            })?;
            config_map.data.get(field).cloned().ok_or_else(|| {
                make_input_err!("Config map {name} referenced by {key} has no field {field}")
            })?
        } else {
            continue;
        };
        *value = resolved;
    }
    Ok(config)
}

/// Names of the records created for one provisioning attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedRecords {
    pub config_map: String,
    pub secret: String,
    pub state: String,
}

/// Creates the ConfigMap, Secret and TfState for `vm`, all owned by it.
pub async fn create_records(
    vm: &VirtualMachine,
    config: BTreeMap<String, String>,
    key_pair: KeyPair,
    config_maps: &Api<ConfigMap>,
    secrets: &Api<Secret>,
    states: &Api<TfState>,
) -> Result<ProvisionedRecords, Error> {
    let vm_name = vm.metadata.name.as_str();
    let spec = TfStateSpec {
        image: config.get(EXECUTOR_IMAGE_KEY).cloned().unwrap_or_default(),
        module_name: config.get(MODULE_KEY).cloned().unwrap_or_default(),
        variables: TfVariables::default(),
        auto_confirm: true,
        destroy_on_delete: true,
        data: BTreeMap::new(),
    };
    let cred_secret = config.get(CRED_SECRET_KEY).filter(|s| !s.is_empty()).cloned();

    let config_map = config_maps
        .create(&ConfigMap {
            metadata: ObjectMeta::named(format!("{vm_name}-cm-{}", rand32())).owned_by(vm),
            data: config,
        })
        .await
        .err_tip(|| format!("Creating config map for vm {vm_name}"))?;

    let secret = secrets
        .create(&Secret {
            metadata: ObjectMeta::named(format!("{vm_name}-secret-{}", rand32())).owned_by(vm),
            string_data: BTreeMap::from([
                ("private_key".to_string(), key_pair.private_key),
                ("public_key".to_string(), key_pair.public_key),
                ("password".to_string(), random_alphanumeric(PASSWORD_LENGTH)),
            ]),
        })
        .await
        .err_tip(|| format!("Creating secret for vm {vm_name}"))?;

    let state = states
        .create(&TfState {
            metadata: ObjectMeta::named(format!("{vm_name}-tfs-{}", rand32())).owned_by(vm),
            spec: TfStateSpec {
                variables: TfVariables {
                    config_names: vec![config_map.metadata.name.clone()],
                    secret_names: cred_secret.into_iter().collect(),
                    ..TfVariables::default()
                },
                ..spec
            },
            ..TfState::default()
        })
        .await
        .err_tip(|| format!("Creating tf state for vm {vm_name}"))?;

    Ok(ProvisionedRecords {
        config_map: config_map.metadata.name,
        secret: secret.metadata.name,
        state: state.metadata.name,
    })
}

/// Addresses reported by the executor for a running VM.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VmAddresses {
    pub private_ip: String,
    pub public_ip: String,
    pub hostname: String,
}

fn output<'a>(outputs: &'a TfOutputs, name: &str) -> Option<&'a str> {
    outputs
        .get(name)
        .and_then(|fields| fields.get("value"))
        .map(String::as_str)
        .filter(|value| !value.is_empty())
}

/// Maps `a.b.c.d` through `translation` keyed by `a.b.c`. Addresses without
/// an entry are returned unchanged.
pub fn translate_ip(private_ip: &str, translation: &BTreeMap<String, String>) -> String {
    let Some((prefix, last_octet)) = private_ip.rsplit_once('.') else {
        return private_ip.to_string();
    };
    match translation.get(prefix) {
        Some(public_prefix) => format!("{}.{last_octet}", public_prefix.trim_end_matches('.')),
        None => private_ip.to_string(),
    }
}

/// Latest execution recorded for `state`, by creation time.
pub fn latest_execution(
    executions: &Lister<TfExecution>,
    state: &str,
) -> Result<Option<TfExecution>, Error> {
    let latest = executions
        .list(&LabelSelector::everything().eq(labels::TF_STATE, state))?
        .into_iter()
        .max_by_key(|execution| execution.metadata.creation_timestamp);
    Ok(latest.map(|execution| execution.as_ref().clone()))
}

/// Addresses from `execution`, or `None` while it has not reported a
/// private IP yet. Undecodable outputs are a `DataLoss` error.
pub fn addresses_from(
    execution: &TfExecution,
    environment: &Environment,
) -> Result<Option<VmAddresses>, Error> {
    let Some(outputs) = execution.outputs()? else {
        return Ok(None);
    };
    let Some(private_ip) = output(&outputs, "private_ip") else {
        debug!(execution = %execution.metadata.name, "Execution outputs have no private_ip yet");
        return Ok(None);
    };
    let public_ip = output(&outputs, "public_ip").map_or_else(
        || translate_ip(private_ip, &environment.spec.ip_translation_map),
        ToString::to_string,
    );
    Ok(Some(VmAddresses {
        private_ip: private_ip.to_string(),
        public_ip,
        hostname: output(&outputs, "hostname").unwrap_or_default().to_string(),
    }))
}

/// Deletes the TfState of a VM. A state that is already gone counts as
/// deleted.
pub async fn delete_state(states: &Api<TfState>, name: &str) -> Result<(), Error> {
    match states.delete(name).await {
        Err(err) if err.code == Code::NotFound => Ok(()),
        result => result.err_tip(|| format!("Deleting tf state {name}")),
    }
}

fn is_owned_by(meta: &ObjectMeta, vm: &VirtualMachine) -> bool {
    meta.owner_references.iter().any(|owner| {
        owner.kind == VirtualMachine::KIND
            && owner.name == vm.metadata.name
            && (owner.uid.is_empty() || owner.uid == vm.metadata.uid)
    })
}

/// Deletes every record [`create_records`] made for `vm`: its TfState, its
/// Secret and any ConfigMap or Secret that names the VM as owner. Records
/// that are already gone count as deleted.
pub async fn delete_records(
    vm: &VirtualMachine,
    config_maps: &Api<ConfigMap>,
    secrets: &Api<Secret>,
    states: &Api<TfState>,
) -> Result<(), Error> {
    let vm_name = vm.metadata.name.as_str();
    if !vm.status.tfstate.is_empty() {
        delete_state(states, &vm.status.tfstate).await?;
    }
    if !vm.spec.secret_name.is_empty() {
        secrets
            .delete_ignore_missing(&vm.spec.secret_name)
            .await
            .err_tip(|| format!("Deleting secret of vm {vm_name}"))?;
    }
    let everything = LabelSelector::everything();
    for config_map in config_maps.list(&everything).await? {
        if is_owned_by(&config_map.metadata, vm) {
            config_maps
                .delete_ignore_missing(&config_map.metadata.name)
                .await
                .err_tip(|| format!("Deleting config map of vm {vm_name}"))?;
        }
    }
    for secret in secrets.list(&everything).await? {
        if is_owned_by(&secret.metadata, vm) {
            secrets
                .delete_ignore_missing(&secret.metadata.name)
                .await
                .err_tip(|| format!("Deleting secret of vm {vm_name}"))?;
        }
    }
    Ok(())
}

/// Environment a VM belongs to: its status, falling back to its label.
pub fn environment_of(vm: &VirtualMachine) -> Result<&str, Error> {
    if !vm.status.environment_id.is_empty() {
        return Ok(&vm.status.environment_id);
    }
    vm.metadata
        .label(labels::ENVIRONMENT)
        .filter(|env| !env.is_empty())
        .ok_or_else(|| {
            make_err!(
                Code::InvalidArgument,
                "Vm {} has no environment",
                vm.metadata.name
            )
        })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use gargantua_resources::environment::{EnvironmentSpec, VirtualMachineTemplateSpec};
    use gargantua_resources::terraform::TfExecutionStatus;
    use gargantua_resources::{
        ConfigMap, Environment, ObjectMeta, Secret, TfExecution, VirtualMachineTemplate,
    };
    use gargantua_store::{Api, MemoryObjectStore, ObjectStore};
    use pretty_assertions::assert_eq;

    use super::{VmAddresses, addresses_from, resolve_config, resolve_handles, translate_ip};

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    fn template() -> VirtualMachineTemplate {
        VirtualMachineTemplate {
            metadata: ObjectMeta::named("vmt1"),
            spec: VirtualMachineTemplateSpec {
                config_map: map(&[
                    ("image", "ubuntu"),
                    ("cloud-config", "url: $_SHELL_ENDPOINT_$/shell"),
                    ("size", "small"),
                ]),
                ..VirtualMachineTemplateSpec::default()
            },
        }
    }

    fn environment(mapping: &[(&str, &str)]) -> Environment {
        Environment {
            metadata: ObjectMeta::named("env1"),
            spec: EnvironmentSpec {
                environment_specifics: map(&[("module", "aws"), ("size", "medium")]),
                template_mapping: BTreeMap::from([("vmt1".to_string(), map(mapping))]),
                ip_translation_map: map(&[("10.0.0", "52.1.2")]),
                ..EnvironmentSpec::default()
            },
        }
    }

    #[test]
    fn later_layers_win() {
        let config = resolve_config(
            &template(),
            &environment(&[("size", "large"), ("executor_image", "tf:1")]),
            "wss://shell.example",
        )
        .unwrap();
        assert_eq!(config["size"], "large");
        assert_eq!(config["module"], "aws");
        assert_eq!(config["cloud-config"], "url: wss://shell.example/shell");
    }

    #[test]
    fn missing_required_key_is_invalid() {
        let err = resolve_config(&template(), &environment(&[]), "").unwrap_err();
        assert_eq!(err.code, gargantua_error::Code::InvalidArgument);
        assert!(err.message_string().contains("executor_image"), "{err:?}");
    }

    #[test]
    fn unmapped_template_is_invalid() {
        let mut env = environment(&[]);
        env.spec.template_mapping.clear();
        let err = resolve_config(&template(), &env, "").unwrap_err();
        assert_eq!(err.code, gargantua_error::Code::InvalidArgument);
    }

    #[test]
    fn ip_translation_keeps_last_octet() {
        let translation = map(&[("10.0.0", "52.1.2")]);
        assert_eq!(translate_ip("10.0.0.17", &translation), "52.1.2.17");
        assert_eq!(translate_ip("10.0.1.17", &translation), "10.0.1.17");
    }

    #[test]
    fn addresses_prefer_reported_public_ip() {
        let mut execution = TfExecution {
            status: TfExecutionStatus {
                outputs: r#"{"private_ip":{"value":"10.0.0.5"},"hostname":{"value":"node-a"}}"#
                    .to_string(),
                ..TfExecutionStatus::default()
            },
            ..TfExecution::default()
        };
        let env = environment(&[]);
        assert_eq!(
            addresses_from(&execution, &env).unwrap(),
            Some(VmAddresses {
                private_ip: "10.0.0.5".to_string(),
                public_ip: "52.1.2.5".to_string(),
                hostname: "node-a".to_string(),
            })
        );

        execution.status.outputs =
            r#"{"private_ip":{"value":"10.0.0.5"},"public_ip":{"value":"1.2.3.4"}}"#.to_string();
        let addresses = addresses_from(&execution, &env).unwrap().unwrap();
        assert_eq!(addresses.public_ip, "1.2.3.4");

        execution.status.outputs = r#"{"hostname":{"value":"x"}}"#.to_string();
        assert_eq!(addresses_from(&execution, &env).unwrap(), None);
    }

    #[tokio::test]
    async fn handles_resolve_against_stored_objects() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryObjectStore::new("hobbyfarm"));
        let config_maps = Api::<ConfigMap>::new(store.clone());
        let secrets = Api::<Secret>::new(store);
        config_maps
            .create(&ConfigMap {
                metadata: ObjectMeta::named("region"),
                data: map(&[("name", "eu-west-1")]),
            })
            .await
            .unwrap();
        secrets
            .create(&Secret {
                metadata: ObjectMeta::named("cloud"),
                string_data: map(&[("token", "s3cr3t")]),
            })
            .await
            .unwrap();

        let config = map(&[
            ("region", "configmap:region:name"),
            ("token", "secret:cloud:token"),
            ("size", "small"),
        ]);
        let resolved = resolve_handles(config, &config_maps, &secrets).await.unwrap();
        assert_eq!(
            resolved,
            map(&[("region", "eu-west-1"), ("size", "small"), ("token", "s3cr3t")])
        );

        for value in ["secret:missing:token", "secret:cloud:user", "configmap:region"] {
            let err = resolve_handles(map(&[("key", value)]), &config_maps, &secrets)
                .await
                .unwrap_err();
            assert_eq!(err.code, gargantua_error::Code::InvalidArgument, "{value}");
        }
    }
}

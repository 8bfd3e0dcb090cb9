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

use std::sync::Arc;

use gargantua_error::{Code, Error};
use gargantua_macro::gargantua_test;
use gargantua_resources::{ObjectMeta, Resource, Session, VirtualMachine};
use gargantua_store::{Api, InformerEvent, InformerFactory, MemoryObjectStore, ObjectStore};
use gargantua_util::labels::LabelSelector;
use pretty_assertions::assert_eq;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn describe(event: &InformerEvent<VirtualMachine>) -> String {
    match event {
        InformerEvent::Added(vm) => format!("added {}", vm.name()),
        InformerEvent::Updated { old, new } => format!(
            "updated {} {}->{}",
            new.name(),
            old.spec.user,
            new.spec.user
        ),
        InformerEvent::Deleted(vm) => format!("deleted {}", vm.name()),
    }
}

fn vm(name: &str) -> VirtualMachine {
    VirtualMachine {
        metadata: ObjectMeta::named(name),
        ..VirtualMachine::default()
    }
}

#[gargantua_test]
async fn lister_refuses_reads_until_synced() -> Result<(), Error> {
    let store: Arc<dyn ObjectStore> = Arc::new(MemoryObjectStore::new("hobbyfarm"));
    let factory = InformerFactory::new(store, None);
    let lister = factory.lister::<VirtualMachine>();
    assert_eq!(lister.get("vm-1").unwrap_err().code, Code::Unavailable);
    assert_eq!(
        lister.list(&LabelSelector::everything()).unwrap_err().code,
        Code::Unavailable
    );

    let shutdown = CancellationToken::new();
    factory.start(&shutdown);
    assert!(factory.wait_for_cache_sync(&shutdown).await);
    assert!(factory.has_synced());
    assert_eq!(lister.get("vm-1").unwrap_err().code, Code::NotFound);
    shutdown.cancel();
    Ok(())
}

#[gargantua_test]
async fn handlers_see_adds_updates_and_deletes() -> Result<(), Error> {
    let store: Arc<dyn ObjectStore> = Arc::new(MemoryObjectStore::new("hobbyfarm"));
    let api: Api<VirtualMachine> = Api::new(store.clone());
    api.create(&vm("existing")).await?;

    let factory = InformerFactory::new(store, None);
    let informer = factory.informer::<VirtualMachine>();
    let (tx, mut rx) = mpsc::unbounded_channel();
    informer.add_event_handler(move |event| {
        tx.send(describe(event)).unwrap();
    });
    let shutdown = CancellationToken::new();
    factory.start(&shutdown);
    assert!(informer.wait_for_sync(&shutdown).await);
    assert_eq!(rx.recv().await.unwrap(), "added existing");

    let created = api.create(&vm("vm-1")).await?;
    assert_eq!(rx.recv().await.unwrap(), "added vm-1");

    let mut changed = created;
    changed.spec.user = "u1".to_string();
    api.update(&changed).await?;
    assert_eq!(rx.recv().await.unwrap(), "updated vm-1 ->u1");
    assert_eq!(informer.lister().get("vm-1")?.spec.user, "u1");

    api.delete("vm-1").await?;
    assert_eq!(rx.recv().await.unwrap(), "deleted vm-1");
    assert_eq!(
        informer.lister().get("vm-1").unwrap_err().code,
        Code::NotFound
    );
    shutdown.cancel();
    Ok(())
}

#[gargantua_test]
async fn late_handlers_are_replayed_the_cache() -> Result<(), Error> {
    let store: Arc<dyn ObjectStore> = Arc::new(MemoryObjectStore::new("hobbyfarm"));
    let api: Api<VirtualMachine> = Api::new(store.clone());
    api.create(&vm("vm-1")).await?;
    api.create(&vm("vm-2")).await?;

    let factory = InformerFactory::new(store, None);
    let informer = factory.informer::<VirtualMachine>();
    let shutdown = CancellationToken::new();
    factory.start(&shutdown);
    assert!(informer.wait_for_sync(&shutdown).await);

    let (tx, mut rx) = mpsc::unbounded_channel();
    informer.add_event_handler(move |event| {
        tx.send(describe(event)).unwrap();
    });
    assert_eq!(rx.recv().await.unwrap(), "added vm-1");
    assert_eq!(rx.recv().await.unwrap(), "added vm-2");
    shutdown.cancel();
    Ok(())
}

#[gargantua_test]
async fn factory_shares_one_informer_per_kind() -> Result<(), Error> {
    let store: Arc<dyn ObjectStore> = Arc::new(MemoryObjectStore::new("hobbyfarm"));
    let factory = InformerFactory::new(store.clone(), None);
    let sessions = factory.informer::<Session>();
    let first = factory.informer::<VirtualMachine>();
    let second = factory.informer::<VirtualMachine>();

    let shutdown = CancellationToken::new();
    factory.start(&shutdown);
    assert!(factory.wait_for_cache_sync(&shutdown).await);

    Api::<VirtualMachine>::new(store).create(&vm("vm-1")).await?;
    let (tx, mut rx) = mpsc::unbounded_channel();
    second.add_event_handler(move |event| {
        tx.send(describe(event)).unwrap();
    });
    assert_eq!(rx.recv().await.unwrap(), "added vm-1");
    assert!(first.lister().get("vm-1").is_ok());
    assert!(sessions.lister().list(&LabelSelector::everything())?.is_empty());
    shutdown.cancel();
    Ok(())
}

#[gargantua_test]
async fn wait_for_sync_gives_up_on_shutdown() -> Result<(), Error> {
    let store: Arc<dyn ObjectStore> = Arc::new(MemoryObjectStore::new("hobbyfarm"));
    let factory = InformerFactory::new(store, None);
    let informer = factory.informer::<VirtualMachine>();
    let shutdown = CancellationToken::new();
    shutdown.cancel();
    // Never started, so only shutdown can end the wait.
    assert!(!informer.wait_for_sync(&shutdown).await);
    Ok(())
}

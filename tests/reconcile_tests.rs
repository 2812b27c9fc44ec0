use gateway_operator::prelude::*;
use gateway_operator::k8s_types::apps::v1::Deployment;
use gateway_operator::k8s_types::core::v1::{Secret, Service};
use gateway_operator::k8s_types::networking_k8s_io::v1::Ingress;
use gateway_operator::reconcile::{EventMapper, StatusConverger};
use gateway_operator::serde_json::{json, Value};
use gateway_operator::store::{MemoryStore, StoreOp};

use tokio::runtime::{self, Runtime};

use std::sync::Arc;

const IMAGE: &str = "quay.io/gateway-operator/gateway:1.2.3";

struct Fixture {
    store: Arc<MemoryStore>,
    reconciler: Reconciler,
    runtime: Runtime,
}

impl Fixture {
    fn new() -> Fixture {
        let _ = env_logger::builder().is_test(true).try_init();
        let store = Arc::new(MemoryStore::new());
        let applier = ChildApplier::new(
            store.clone(),
            DefaultGatewayFactory::new(IMAGE),
            "gateway-operator",
        );
        let reconciler = Reconciler::new(store.clone(), Arc::new(applier));
        let runtime = runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        Fixture {
            store,
            reconciler,
            runtime,
        }
    }

    fn create_gateway(&self, name: &str, spec: Value) {
        self.store.insert(
            GATEWAY,
            json!({
                "metadata": {"namespace": "ns", "name": name},
                "spec": spec,
            }),
        );
    }

    fn reconcile(&self, name: &str) -> Result<ReconcileResult, Error> {
        self.runtime
            .block_on(self.reconciler.reconcile(&ReconcileRequest::new("ns", name)))
    }

    /// Reconciles until a pass returns without requeueing, returning the number of passes
    fn reconcile_until_converged(&self, name: &str) -> usize {
        for pass in 1..=10 {
            let result = self.reconcile(name).expect("reconcile failed");
            if !result.requeue {
                return pass;
            }
        }
        panic!("gateway '{}' did not converge within 10 passes", name);
    }

    fn gateway(&self, name: &str) -> Value {
        self.store
            .peek(GATEWAY, &ObjectIdRef::new("ns", name))
            .expect("gateway is missing")
    }
}

fn child_id(gateway_name: &str) -> String {
    format!("gateway-{}", gateway_name)
}

#[test]
fn new_gateway_gets_children_and_status() {
    let fixture = Fixture::new();
    fixture.create_gateway("foo", json!({"exposedHost": {"host": "foo.example.com"}}));

    // children are created, then the status is written, then nothing is left to do
    assert_eq!(3, fixture.reconcile_until_converged("foo"));

    let child = child_id("foo");
    let id = ObjectIdRef::new("ns", child.as_str());
    for &k8s_type in [Deployment, Service, Ingress].iter() {
        let obj = fixture
            .store
            .peek(k8s_type, &id)
            .unwrap_or_else(|| panic!("missing {}", k8s_type.kind));
        assert_eq!(
            Some(&json!("Gateway")),
            obj.pointer("/metadata/ownerReferences/0/kind")
        );
    }
    assert_eq!(
        Some(&json!(IMAGE)),
        fixture.gateway("foo").pointer("/status/deployedImage")
    );
}

#[test]
fn converged_gateway_is_idempotent() {
    let fixture = Fixture::new();
    fixture.create_gateway("foo", json!({}));
    fixture.reconcile_until_converged("foo");
    fixture.store.clear_writes();

    for _ in 0..2 {
        let result = fixture.reconcile("foo").unwrap();
        assert_eq!(ReconcileResult::done(), result);
    }
    assert_eq!(0, fixture.store.write_count());
}

#[test]
fn status_drift_is_corrected_in_one_pass() {
    let fixture = Fixture::new();
    fixture.create_gateway("foo", json!({}));
    fixture.reconcile_until_converged("foo");
    fixture.store.modify(GATEWAY, &ObjectIdRef::new("ns", "foo"), |gw| {
        gw["status"] = json!({"deployedImage": "something-else:0.1"});
    });
    fixture.store.clear_writes();

    assert_eq!(ReconcileResult::requeue(), fixture.reconcile("foo").unwrap());
    assert_eq!(1, fixture.store.call_count(StoreOp::UpdateStatus));
    assert_eq!(ReconcileResult::done(), fixture.reconcile("foo").unwrap());
    assert_eq!(1, fixture.store.write_count());
    assert_eq!(
        Some(&json!(IMAGE)),
        fixture.gateway("foo").pointer("/status/deployedImage")
    );
}

#[test]
fn conflicting_status_write_is_requeued_without_error() {
    let fixture = Fixture::new();
    fixture.create_gateway("foo", json!({}));
    assert!(fixture.reconcile("foo").unwrap().requeue);

    fixture.store.fail_next(
        StoreOp::UpdateStatus,
        StoreError::Conflict(
            ObjectId::new("ns".to_owned(), "foo".to_owned()),
            "the object has been modified".to_owned(),
        ),
    );
    assert_eq!(ReconcileResult::requeue(), fixture.reconcile("foo").unwrap());
    assert_eq!(ReconcileResult::requeue(), fixture.reconcile("foo").unwrap());
    assert_eq!(ReconcileResult::done(), fixture.reconcile("foo").unwrap());
}

#[test]
fn stale_gateway_loses_the_status_race() {
    let fixture = Fixture::new();
    fixture.create_gateway("foo", json!({}));
    fixture.reconcile_until_converged("foo");
    let stale = Gateway::from_resource(
        fixture
            .runtime
            .block_on(fixture.store.get(GATEWAY, &ObjectIdRef::new("ns", "foo")))
            .unwrap(),
    )
    .unwrap();

    // another writer changes the status after the gateway was read
    fixture.store.modify(GATEWAY, &ObjectIdRef::new("ns", "foo"), |gw| {
        gw["status"] = json!({"deployedImage": "other:1"});
    });
    let stale_update = stale.status_update("other:2");
    let err = fixture
        .runtime
        .block_on(
            fixture
                .store
                .update_status(GATEWAY, &stale.id(), &stale_update),
        )
        .expect_err("expected a conflict");
    assert!(err.is_conflict());

    // a full pass starts over with fresh reads
    assert_eq!(ReconcileResult::requeue(), fixture.reconcile("foo").unwrap());
    assert_eq!(ReconcileResult::done(), fixture.reconcile("foo").unwrap());
}

#[test]
fn missing_deployment_is_requeued_without_error() {
    let fixture = Fixture::new();
    fixture.create_gateway("foo", json!({}));
    let gateway = Gateway::from_resource(
        fixture
            .runtime
            .block_on(fixture.store.get(GATEWAY, &ObjectIdRef::new("ns", "foo")))
            .unwrap(),
    )
    .unwrap();

    let converger = StatusConverger::new(fixture.store.clone());
    let result = fixture.runtime.block_on(converger.converge(&gateway)).unwrap();
    assert_eq!(ReconcileResult::requeue(), result);
    assert_eq!(0, fixture.store.write_count());
}

#[test]
fn deleted_dependent_is_recreated() {
    let fixture = Fixture::new();
    fixture.create_gateway("foo", json!({}));
    fixture.reconcile_until_converged("foo");
    let child = child_id("foo");
    fixture
        .store
        .remove(Service, &ObjectIdRef::new("ns", child.as_str()));
    fixture.store.clear_writes();

    assert_eq!(ReconcileResult::requeue(), fixture.reconcile("foo").unwrap());
    assert_eq!(1, fixture.store.call_count(StoreOp::Create));
    assert_eq!(ReconcileResult::done(), fixture.reconcile("foo").unwrap());
}

#[test]
fn deleted_gateway_is_done_without_error() {
    let fixture = Fixture::new();
    fixture.create_gateway("foo", json!({}));
    fixture.reconcile_until_converged("foo");
    fixture.store.remove(GATEWAY, &ObjectIdRef::new("ns", "foo"));
    fixture.store.clear_writes();

    assert_eq!(ReconcileResult::done(), fixture.reconcile("foo").unwrap());
    assert_eq!(ReconcileResult::done(), fixture.reconcile("never-existed").unwrap());
    assert_eq!(0, fixture.store.write_count());
}

#[test]
fn secret_events_only_reach_referencing_gateways() {
    let fixture = Fixture::new();
    fixture.create_gateway(
        "uses-conf",
        json!({"embeddedConfigurationSecretRef": {"name": "conf"}}),
    );
    fixture.create_gateway("no-conf", json!({}));
    let selector = LabelSelector::new().with_label("apps.gateway-operator.io/watched-by", "gateway-operator");
    let mapper = EventMapper::new(fixture.store.clone(), selector);

    let unlabeled = fixture.store.insert(
        Secret,
        json!({"metadata": {"namespace": "ns", "name": "conf"}}),
    );
    assert!(fixture.runtime.block_on(mapper.map_event(&unlabeled)).is_empty());

    let labeled = fixture.store.insert(
        Secret,
        json!({"metadata": {
            "namespace": "ns",
            "name": "conf",
            "labels": {"apps.gateway-operator.io/watched-by": "gateway-operator"},
        }}),
    );
    assert_eq!(
        vec![ReconcileRequest::new("ns", "uses-conf")],
        fixture.runtime.block_on(mapper.map_event(&labeled))
    );
}

#[test]
fn secret_reference_is_mounted_into_the_deployment() {
    let fixture = Fixture::new();
    fixture.create_gateway(
        "foo",
        json!({"embeddedConfigurationSecretRef": {"name": "conf"}, "image": "custom:7"}),
    );
    fixture.reconcile_until_converged("foo");

    let child = child_id("foo");
    let deployment = fixture
        .store
        .peek(Deployment, &ObjectIdRef::new("ns", child.as_str()))
        .unwrap();
    assert_eq!(
        Some(&json!("conf")),
        deployment.pointer("/spec/template/spec/volumes/0/secret/secretName")
    );
    assert_eq!(
        Some(&json!("custom:7")),
        fixture.gateway("foo").pointer("/status/deployedImage")
    );
}

#[test]
fn removed_spec_fields_are_converged_away() {
    let fixture = Fixture::new();
    fixture.create_gateway(
        "foo",
        json!({
            "exposedHost": {"host": "foo.example.com"},
            "embeddedConfigurationSecretRef": {"name": "cfg"},
        }),
    );
    fixture.reconcile_until_converged("foo");
    let child = child_id("foo");
    let id = ObjectIdRef::new("ns", child.as_str());
    assert!(fixture.store.peek(Ingress, &id).is_some());

    fixture.store.modify(GATEWAY, &ObjectIdRef::new("ns", "foo"), |gw| {
        gw["spec"] = json!({});
    });
    fixture.store.clear_writes();
    assert!(fixture.reconcile_until_converged("foo") > 1);

    assert!(
        fixture.store.peek(Ingress, &id).is_none(),
        "ingress still exposes the gateway after exposedHost was removed"
    );
    let deployment = fixture.store.peek(Deployment, &id).unwrap();
    assert!(deployment.pointer("/spec/template/spec/volumes").is_none());
    assert!(deployment
        .pointer("/spec/template/spec/containers/0/env")
        .is_none());
    assert!(fixture
        .store
        .writes()
        .iter()
        .any(|w| w.op == StoreOp::Delete && w.kind == "Ingress"));

    fixture.store.clear_writes();
    assert_eq!(ReconcileResult::done(), fixture.reconcile("foo").unwrap());
    assert_eq!(0, fixture.store.write_count());
}

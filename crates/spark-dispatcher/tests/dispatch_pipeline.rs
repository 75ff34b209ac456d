//! 分发流水线端到端测试：注册、亲和、呼叫记录、归属映射与请求预检。
//!
//! # 教案级说明
//! - **意图 (Why)**：验证各策略组件被流水线以正确的优先级串联，且 fail-open 路径从不阻塞请求；
//! - **结构 (How)**：内存表 + 脚本化 Runtime，每个测试独立构造，克隆的内存表共享同一份数据便于检查。

mod support;

use std::sync::Arc;
use std::time::Duration;

use spark_dispatcher::{
    Admission, AffinityStore, Binding, BranchEvent, ContactRegistry, DispatchConfig,
    DispatchPipeline, DispatchRuntimeConfig, Disposition, InboundRequest, LocalityMap,
    ManualClock, MemoryAffinityStore, MemoryContactRegistry, Method, RegistrationMode,
    RejectReason, Release, RelayError, ReplyOutcome, RouteSource, SaveMode, StoredValue,
};
use support::{
    CONTACT, CONTACT_ADDRESS, FlakyRegistry, SUBSCRIBER, SaveEffect, ScriptedRuntime,
    UnreachableStore, aor, dst,
};

const A: &str = "sip:10.0.0.1:5060";
const B: &str = "sip:10.0.0.2:5060";
const C: &str = "sip:10.0.0.3:5060";

struct Harness {
    pipeline: DispatchPipeline,
    store: MemoryAffinityStore,
    registry: MemoryContactRegistry,
}

fn harness(config: DispatchConfig) -> Harness {
    harness_with_store(config, MemoryAffinityStore::new())
}

fn harness_with_store(config: DispatchConfig, store: MemoryAffinityStore) -> Harness {
    let registry = MemoryContactRegistry::new();
    let pipeline = DispatchPipeline::new(
        Arc::new(DispatchRuntimeConfig::new(config).expect("valid config")),
        Arc::new(store.clone()),
        Arc::new(registry.clone()),
    );
    Harness {
        pipeline,
        store,
        registry,
    }
}

fn register() -> InboundRequest {
    InboundRequest::new(Method::Register, "reg-1")
        .with_contact(CONTACT)
        .with_request_user(SUBSCRIBER)
}

fn unregister() -> InboundRequest {
    InboundRequest::new(Method::Register, "reg-2")
        .with_contact(format!("{CONTACT};expires=0"))
        .with_request_user(SUBSCRIBER)
}

fn invite(call_id: &str) -> InboundRequest {
    InboundRequest::new(Method::Invite, call_id)
        .with_contact(CONTACT)
        .with_request_user("s09876543210")
}

fn binding(index: usize, stamp: u64) -> Binding {
    Binding::new(format!("sip:{SUBSCRIBER}@192.0.2.{index}:5060"), stamp)
}

#[test]
fn full_binding_set_evicts_the_stalest_before_saving() {
    let h = harness(DispatchConfig::default());
    for (index, stamp) in [10, 20, 5, 30, 25].into_iter().enumerate() {
        h.registry.upsert(aor(), binding(index, stamp));
    }
    let mut runtime = ScriptedRuntime::with_registry(&[A], h.registry.clone());
    runtime.save_effect = SaveEffect::Upsert(aor(), Binding::new(CONTACT_ADDRESS, 40));

    let disposition = h.pipeline.handle_request(&mut runtime, &register());
    let (who, admission) = match disposition {
        Disposition::Registered { aor, admission } => (aor, admission),
        other => panic!("local registration expected, got {other:?}"),
    };
    assert_eq!(who, aor());
    assert_eq!(admission, Admission::Evicted(binding(2, 5)));
    assert_eq!(runtime.saved, vec![SaveMode::Reply]);
    assert_eq!(runtime.select_calls, 0);

    let remaining = h.registry.lookup_bindings(&aor()).unwrap();
    assert_eq!(remaining.len(), 5);
    assert!(remaining.iter().all(|b| b.last_modified != 5));
}

#[test]
fn registry_outage_admits_without_eviction() {
    let store = MemoryAffinityStore::new();
    let registry = FlakyRegistry::new(MemoryContactRegistry::new());
    registry.fail_lookup(true);
    let pipeline = DispatchPipeline::new(
        Arc::new(DispatchRuntimeConfig::new(DispatchConfig::default()).unwrap()),
        Arc::new(store),
        Arc::new(registry.clone()),
    );
    let mut runtime = ScriptedRuntime::new(&[A]);

    let disposition = pipeline.handle_request(&mut runtime, &register());
    assert!(matches!(
        disposition,
        Disposition::Registered {
            admission: Admission::LookupFailed,
            ..
        }
    ));
    assert_eq!(runtime.saved, vec![SaveMode::Reply]);
}

#[test]
fn rejected_eviction_does_not_block_registration() {
    let inner = MemoryContactRegistry::new();
    for index in 0..5 {
        inner.upsert(aor(), binding(index, 100 + index as u64));
    }
    let registry = FlakyRegistry::new(inner);
    registry.fail_remove(true);
    let pipeline = DispatchPipeline::new(
        Arc::new(DispatchRuntimeConfig::new(DispatchConfig::default()).unwrap()),
        Arc::new(MemoryAffinityStore::new()),
        Arc::new(registry.clone()),
    );
    let mut runtime = ScriptedRuntime::new(&[A]);

    let disposition = pipeline.handle_request(&mut runtime, &register());
    assert!(matches!(
        disposition,
        Disposition::Registered {
            admission: Admission::EvictionFailed(_),
            ..
        }
    ));
    assert_eq!(registry.inner.count(&aor()), 5);
}

#[test]
fn sticky_registrations_resolve_to_one_destination() {
    let config = DispatchConfig {
        subscriber_affinity: true,
        registration_mode: RegistrationMode::Forward,
        ..DispatchConfig::default()
    };
    let h = harness(config);
    let mut runtime = ScriptedRuntime::new(&[A, B, C]);

    let first = h
        .pipeline
        .handle_request(&mut runtime, &register())
        .into_context()
        .expect("forwarded");
    runtime.next_request();
    let second = h
        .pipeline
        .handle_request(&mut runtime, &register())
        .into_context()
        .expect("forwarded");

    assert_eq!(first.destination(), Some(&dst(A)));
    assert_eq!(second.destination(), Some(&dst(A)));
    assert_eq!(first.source(), RouteSource::Selected);
    assert_eq!(second.source(), RouteSource::Affinity);
    assert_eq!(runtime.select_calls, 1);
    assert_eq!(runtime.saved, vec![SaveMode::Silent, SaveMode::Silent]);
    assert_eq!(runtime.relayed, vec![Some(dst(A)), Some(dst(A))]);
}

#[test]
fn without_sticky_mode_every_decision_selects_afresh() {
    let config = DispatchConfig {
        registration_mode: RegistrationMode::Forward,
        ..DispatchConfig::default()
    };
    let h = harness(config);
    let mut runtime = ScriptedRuntime::new(&[A, B, C]);

    let first = h.pipeline.handle_request(&mut runtime, &register());
    runtime.next_request();
    let second = h.pipeline.handle_request(&mut runtime, &register());

    assert_eq!(first.context().and_then(|c| c.destination()), Some(&dst(A)));
    assert_eq!(second.context().and_then(|c| c.destination()), Some(&dst(B)));
    assert_eq!(runtime.select_calls, 2);
    assert_eq!(h.store.get("sticky", SUBSCRIBER).unwrap(), None);
}

#[test]
fn affinity_expires_with_its_ttl() {
    let clock = ManualClock::new();
    let store = MemoryAffinityStore::with_clock(Arc::new(clock.clone()));
    let config = DispatchConfig {
        subscriber_affinity: true,
        subscriber_affinity_ttl_secs: 60,
        ..DispatchConfig::default()
    };
    let h = harness_with_store(config, store);
    let mut runtime = ScriptedRuntime::new(&[A, B]);

    let first = h.pipeline.handle_request(&mut runtime, &invite("call-a"));
    runtime.next_request();
    clock.advance(Duration::from_secs(59));
    let second = h.pipeline.handle_request(&mut runtime, &invite("call-b"));
    runtime.next_request();
    clock.advance(Duration::from_secs(2));
    let third = h.pipeline.handle_request(&mut runtime, &invite("call-c"));

    let destination = |d: &Disposition| d.context().and_then(|c| c.destination()).cloned();
    assert_eq!(destination(&first), Some(dst(A)));
    assert_eq!(destination(&second), Some(dst(A)));
    assert_eq!(destination(&third), Some(dst(B)));
    assert_eq!(runtime.select_calls, 2);
}

#[test]
fn call_record_overrides_policy_until_terminal_response() {
    let h = harness(DispatchConfig::default());
    let mut runtime = ScriptedRuntime::new(&[A, B, C]);

    let mut invite_context = h
        .pipeline
        .handle_request(&mut runtime, &invite("call-3"))
        .into_context()
        .expect("relayed");
    assert_eq!(invite_context.destination(), Some(&dst(A)));
    assert!(invite_context.tracks_call_record());
    assert_eq!(
        h.pipeline
            .handle_reply(&mut runtime, &mut invite_context, BranchEvent::Reply { status: 200 }),
        ReplyOutcome::Forward
    );
    assert_eq!(
        h.store.get("callmap", "call-3").unwrap(),
        Some(StoredValue::from(A))
    );

    // 同一关联键的后续初始请求不再触发选择。
    runtime.next_request();
    let again = h.pipeline.handle_request(&mut runtime, &invite("call-3"));
    let again = again.context().expect("relayed");
    assert_eq!(again.destination(), Some(&dst(A)));
    assert_eq!(again.source(), RouteSource::CallRecord);
    assert!(again.failover().is_none());
    assert_eq!(runtime.select_calls, 1);

    // 对话内 BYE 经松散路由后仍落到同一后端。
    runtime.next_request();
    runtime.loose_routed = true;
    let bye = InboundRequest::new(Method::Bye, "call-3").within_dialog();
    let mut bye_context = h
        .pipeline
        .handle_request(&mut runtime, &bye)
        .into_context()
        .expect("relayed");
    assert_eq!(bye_context.destination(), Some(&dst(A)));
    assert_eq!(runtime.current, Some(dst(A)));

    h.pipeline
        .handle_reply(&mut runtime, &mut bye_context, BranchEvent::Reply { status: 200 });
    assert_eq!(h.store.get("callmap", "call-3").unwrap(), None);
}

#[test]
fn call_record_outranks_subscriber_affinity() {
    let config = DispatchConfig {
        subscriber_affinity: true,
        ..DispatchConfig::default()
    };
    let h = harness(config);
    let ttl = Duration::from_secs(600);
    h.store
        .set_with_expire("sticky", SUBSCRIBER, StoredValue::from(B), ttl)
        .unwrap();
    h.store
        .set_with_expire("callmap", "call-pinned", StoredValue::from(A), ttl)
        .unwrap();
    let mut runtime = ScriptedRuntime::new(&[A, B, C]);

    let disposition = h.pipeline.handle_request(&mut runtime, &invite("call-pinned"));
    let context = disposition.context().expect("relayed");
    assert_eq!(context.destination(), Some(&dst(A)));
    assert_eq!(context.source(), RouteSource::CallRecord);
    assert_eq!(runtime.relayed, vec![Some(dst(A))]);
    assert_eq!(runtime.select_calls, 0);
    assert_eq!(
        h.store.get("sticky", SUBSCRIBER).unwrap(),
        Some(StoredValue::from(B))
    );
}

#[test]
fn call_affinity_can_be_disabled() {
    let config = DispatchConfig {
        call_affinity: false,
        ..DispatchConfig::default()
    };
    let h = harness(config);
    let mut runtime = ScriptedRuntime::new(&[A, B]);
    let context = h.pipeline.handle_request(&mut runtime, &invite("call-x"));

    assert!(!context.context().expect("relayed").tracks_call_record());
    assert!(h.store.is_empty());
}

#[test]
fn unregister_of_last_binding_releases_locality() {
    let config = DispatchConfig {
        locality: true,
        node_id: "edge-1".to_owned(),
        ..DispatchConfig::default()
    };
    let h = harness(config.clone());
    let mut runtime = ScriptedRuntime::with_registry(&[A], h.registry.clone());
    runtime.save_effect = SaveEffect::Upsert(aor(), Binding::new(CONTACT_ADDRESS, 1));

    let registered = h.pipeline.handle_request(&mut runtime, &register());
    assert!(matches!(registered, Disposition::Registered { .. }));
    let locality = LocalityMap::from_config(&h.store, &config);
    let record = locality.get(&aor()).unwrap().expect("locality recorded");
    assert_eq!(record.owner, dst("edge-1"));

    runtime.next_request();
    runtime.save_effect = SaveEffect::Remove(aor(), CONTACT_ADDRESS.to_owned());
    let disposition = h.pipeline.handle_request(&mut runtime, &unregister());
    assert!(matches!(
        disposition,
        Disposition::Unregistered {
            release: Release::Released,
            ..
        }
    ));
    assert_eq!(locality.get(&aor()).unwrap(), None);
}

#[test]
fn unregister_keeps_locality_while_bindings_remain() {
    let config = DispatchConfig {
        locality: true,
        ..DispatchConfig::default()
    };
    let h = harness(config.clone());
    h.registry.upsert(aor(), binding(9, 3));
    let locality = LocalityMap::from_config(&h.store, &config);
    locality.record_if_absent(&aor(), &dst("local")).unwrap();

    let mut runtime = ScriptedRuntime::with_registry(&[A], h.registry.clone());
    let disposition = h.pipeline.handle_request(&mut runtime, &unregister());
    assert!(matches!(
        disposition,
        Disposition::Unregistered {
            release: Release::Retained { remaining: 1 },
            ..
        }
    ));
    assert!(locality.get(&aor()).unwrap().is_some());
}

#[test]
fn forwarded_registration_records_backend_as_owner_on_success() {
    let config = DispatchConfig {
        locality: true,
        registration_mode: RegistrationMode::Forward,
        ..DispatchConfig::default()
    };
    let h = harness(config.clone());
    let mut runtime = ScriptedRuntime::new(&[A, B]);
    let mut context = h
        .pipeline
        .handle_request(&mut runtime, &register())
        .into_context()
        .expect("forwarded");

    let locality = LocalityMap::from_config(&h.store, &config);
    assert_eq!(locality.get(&aor()).unwrap(), None);

    h.pipeline
        .handle_reply(&mut runtime, &mut context, BranchEvent::Reply { status: 200 });
    let record = locality.get(&aor()).unwrap().expect("owner recorded");
    assert_eq!(record.owner, dst(A));
}

#[test]
fn eager_affinity_invalidation_is_opt_in() {
    for eager in [false, true] {
        let config = DispatchConfig {
            subscriber_affinity: true,
            invalidate_affinity_on_empty: eager,
            ..DispatchConfig::default()
        };
        let h = harness(config);
        h.store
            .set_with_expire("sticky", SUBSCRIBER, StoredValue::from(A), Duration::from_secs(60))
            .unwrap();
        let mut runtime = ScriptedRuntime::new(&[A]);

        h.pipeline.handle_request(&mut runtime, &unregister());
        let kept = h.store.get("sticky", SUBSCRIBER).unwrap().is_some();
        assert_eq!(kept, !eager);
    }
}

#[test]
fn binding_expiry_runs_locality_cleanup() {
    let config = DispatchConfig {
        locality: true,
        ..DispatchConfig::default()
    };
    let h = harness(config.clone());
    let locality = LocalityMap::from_config(&h.store, &config);
    locality.record_if_absent(&aor(), &dst("local")).unwrap();

    assert_eq!(
        h.pipeline
            .handle_binding_expired("sip:s01234567890@198.51.100.7:5060"),
        Some(Release::Released)
    );
    assert_eq!(locality.get(&aor()).unwrap(), None);
    assert_eq!(h.pipeline.handle_binding_expired("sip:198.51.100.7"), None);
}

#[test]
fn reset_affinity_forces_reselection() {
    let config = DispatchConfig {
        subscriber_affinity: true,
        ..DispatchConfig::default()
    };
    let h = harness(config);
    let mut runtime = ScriptedRuntime::new(&[A, B]);

    h.pipeline.handle_request(&mut runtime, &invite("call-1"));
    h.pipeline.reset_affinity(&aor()).unwrap();
    runtime.next_request();
    let after = h.pipeline.handle_request(&mut runtime, &invite("call-2"));

    assert_eq!(after.context().and_then(|c| c.destination()), Some(&dst(B)));
    assert_eq!(runtime.select_calls, 2);
}

#[test]
fn sticky_toggle_applies_to_the_next_request() {
    let h = harness(DispatchConfig::default());
    let mut runtime = ScriptedRuntime::new(&[A, B]);

    let before = h.pipeline.handle_request(&mut runtime, &invite("call-1"));
    h.pipeline
        .runtime_config()
        .set_subscriber_affinity(true)
        .unwrap();
    runtime.next_request();
    let after = h.pipeline.handle_request(&mut runtime, &invite("call-2"));

    assert!(!before.context().unwrap().config().subscriber_affinity);
    assert!(after.context().unwrap().config().subscriber_affinity);
    assert!(h.store.get("sticky", SUBSCRIBER).unwrap().is_some());
}

#[test]
fn unreachable_store_fails_open() {
    let config = DispatchConfig {
        subscriber_affinity: true,
        locality: true,
        ..DispatchConfig::default()
    };
    let pipeline = DispatchPipeline::new(
        Arc::new(DispatchRuntimeConfig::new(config).unwrap()),
        Arc::new(UnreachableStore),
        Arc::new(MemoryContactRegistry::new()),
    );
    let mut runtime = ScriptedRuntime::new(&[A]);

    let dispatched = pipeline.handle_request(&mut runtime, &invite("call-1"));
    assert_eq!(
        dispatched.context().and_then(|c| c.destination()),
        Some(&dst(A))
    );

    runtime.next_request();
    let registered = pipeline.handle_request(&mut runtime, &register());
    assert!(matches!(registered, Disposition::Registered { .. }));
}

#[test]
fn prechecks_reject_before_any_state_is_touched() {
    let h = harness(DispatchConfig::default());

    let mut runtime = ScriptedRuntime::new(&[A]);
    runtime.max_forwards_ok = false;
    assert_eq!(
        h.pipeline.handle_request(&mut runtime, &invite("c")).rejection(),
        Some(RejectReason::TooManyHops)
    );

    let mut runtime = ScriptedRuntime::new(&[A]);
    runtime.sane = false;
    assert_eq!(
        h.pipeline.handle_request(&mut runtime, &register()).rejection(),
        Some(RejectReason::MalformedMessage)
    );
    assert!(runtime.saved.is_empty());
    assert!(h.store.is_empty());
}

#[test]
fn registration_requires_valid_subscriber_and_credentials() {
    let h = harness(DispatchConfig::default());
    let mut runtime = ScriptedRuntime::new(&[A]);

    let foreign = InboundRequest::new(Method::Register, "r")
        .with_contact("<sip:alice@198.51.100.7:5060>");
    assert_eq!(
        h.pipeline.handle_request(&mut runtime, &foreign).rejection(),
        Some(RejectReason::NotFound)
    );

    runtime.authorization = spark_dispatcher::Authorization::Challenge;
    let challenged = h.pipeline.handle_request(&mut runtime, &register());
    assert_eq!(
        challenged.rejection(),
        Some(RejectReason::AuthenticationChallenge)
    );
    assert_eq!(RejectReason::AuthenticationChallenge.status_code(), 401);
    assert!(runtime.saved.is_empty());

    runtime.authorization = spark_dispatcher::Authorization::Authorized;
    runtime.save_fails = true;
    assert_eq!(
        h.pipeline.handle_request(&mut runtime, &register()).rejection(),
        Some(RejectReason::ServerError)
    );
}

#[test]
fn dispatch_outcomes_for_unroutable_requests() {
    let h = harness(DispatchConfig::default());
    let mut runtime = ScriptedRuntime::new(&[A]);

    let presence = InboundRequest::new(Method::Subscribe, "p").with_contact(CONTACT);
    assert_eq!(
        h.pipeline.handle_request(&mut runtime, &presence).rejection(),
        Some(RejectReason::NotFound)
    );

    let no_user = InboundRequest::new(Method::Invite, "n").with_contact(CONTACT);
    assert_eq!(
        h.pipeline.handle_request(&mut runtime, &no_user).rejection(),
        Some(RejectReason::AddressIncomplete)
    );

    let bad_contact = InboundRequest::new(Method::Invite, "b")
        .with_contact("<sip:bob@198.51.100.7>")
        .with_request_user("s09876543210");
    assert_eq!(
        h.pipeline.handle_request(&mut runtime, &bad_contact).rejection(),
        Some(RejectReason::NotFound)
    );
    assert_eq!(runtime.select_calls, 0);

    let mut empty = ScriptedRuntime::new(&[]);
    let rejected = h.pipeline.handle_request(&mut empty, &invite("e"));
    assert_eq!(
        rejected.rejection(),
        Some(RejectReason::NoDestinationAvailable)
    );
    assert_eq!(RejectReason::NoDestinationAvailable.reason_phrase(), "No destination");
    assert_eq!(empty.select_calls, 1);
    assert_eq!(h.store.get("callmap", "e").unwrap(), None);

    runtime.relay_results.push_back(Err(RelayError::new("send failed")));
    assert_eq!(
        h.pipeline.handle_request(&mut runtime, &invite("r")).rejection(),
        Some(RejectReason::ServerError)
    );
    assert_eq!(h.store.get("callmap", "r").unwrap(), None);
}

#[test]
fn transaction_layer_requests() {
    let h = harness(DispatchConfig::default());
    let mut runtime = ScriptedRuntime::new(&[A]);

    let cancel = InboundRequest::new(Method::Cancel, "c1");
    assert!(matches!(
        h.pipeline.handle_request(&mut runtime, &cancel),
        Disposition::Absorbed
    ));
    runtime.transaction_exists = true;
    assert!(matches!(
        h.pipeline.handle_request(&mut runtime, &cancel),
        Disposition::Relayed(_)
    ));

    let ack = InboundRequest::new(Method::Ack, "c1");
    assert!(matches!(
        h.pipeline.handle_request(&mut runtime, &ack),
        Disposition::Absorbed
    ));
    assert_eq!(runtime.relay_count(), 1);

    runtime.next_request();
    let in_dialog_ack = InboundRequest::new(Method::Ack, "c1").within_dialog();
    assert!(matches!(
        h.pipeline.handle_request(&mut runtime, &in_dialog_ack),
        Disposition::Absorbed
    ));
    runtime.transaction_exists = true;
    assert!(matches!(
        h.pipeline.handle_request(&mut runtime, &in_dialog_ack),
        Disposition::Relayed(_)
    ));

    let stray_bye = InboundRequest::new(Method::Bye, "c2").within_dialog();
    assert_eq!(
        h.pipeline.handle_request(&mut runtime, &stray_bye).rejection(),
        Some(RejectReason::NotFound)
    );
    assert_eq!(runtime.select_calls, 0);
}

#[test]
fn backend_originated_requests_bypass_selection() {
    let h = harness(DispatchConfig {
        subscriber_affinity: true,
        ..DispatchConfig::default()
    });
    let mut runtime = ScriptedRuntime::new(&[A, B]);
    runtime.from_destination_set = true;

    let disposition = h.pipeline.handle_request(&mut runtime, &invite("from-backend"));
    let context = disposition.context().expect("relayed as-is");
    assert_eq!(context.source(), RouteSource::Runtime);
    assert!(context.failover().is_none());
    assert_eq!(runtime.select_calls, 0);
    assert!(h.store.is_empty());
}

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use spark_core::{Message, TimeoutBudget, codes};
use spark_session::testing::{FakeBehavior, FakeFactory, FakeFailure};
use spark_session::{
    BinderSettings, ChannelShape, ClientReliableChannelBinder, CommunicationState, EndpointAddress,
    MaskingMode, ReceiveOutcome, TolerateFaultsMode,
};

fn budget() -> TimeoutBudget {
    TimeoutBudget::new(Duration::from_secs(5))
}

async fn opened(
    shape: ChannelShape,
    behavior: FakeBehavior,
    settings: BinderSettings,
) -> (ClientReliableChannelBinder, Arc<FakeFactory>) {
    let factory = Arc::new(FakeFactory::new(shape, behavior));
    let binder = ClientReliableChannelBinder::create(
        factory.clone(),
        EndpointAddress::new("net.tcp://service.example/orders"),
        settings,
    )
    .unwrap();
    binder.open(budget()).await.unwrap();
    (binder, factory)
}

async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_hold_the_channel_one_at_a_time() {
    let behavior = FakeBehavior {
        op_delay: Duration::from_millis(15),
        ..FakeBehavior::default()
    };
    let (binder, factory) = opened(ChannelShape::Request, behavior, BinderSettings::default()).await;

    let mut tasks = Vec::new();
    for i in 0..8 {
        let binder = binder.clone();
        tasks.push(tokio::spawn(async move {
            let body = format!("order-{i}");
            let reply = binder
                .request(Message::new(body.clone()), budget(), MaskingMode::None)
                .await
                .unwrap()
                .expect("reply");
            assert_eq!(reply.body().as_ref(), body.to_ascii_uppercase().as_bytes());
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(factory.stats().max_active(), 1);
    assert_eq!(factory.created(), 1);
    assert_eq!(factory.stats().sent().len(), 8);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplex_replies_are_correlated_under_contention() {
    let behavior = FakeBehavior {
        op_delay: Duration::from_millis(5),
        ..FakeBehavior::default()
    };
    let (binder, factory) = opened(ChannelShape::Duplex, behavior, BinderSettings::default()).await;

    let mut tasks = Vec::new();
    for i in 0..6 {
        let binder = binder.clone();
        tasks.push(tokio::spawn(async move {
            let body = format!("q{i}");
            let reply = binder
                .request(Message::new(body.clone()), budget(), MaskingMode::None)
                .await
                .unwrap()
                .expect("reply");
            assert_eq!(reply.body().as_ref(), body.to_ascii_uppercase().as_bytes());
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(factory.stats().max_active(), 1);
    binder.close(budget(), MaskingMode::None).await.unwrap();
}

#[tokio::test]
async fn zero_budget_acquire_follows_masking_mode() {
    for masking in [
        MaskingMode::None,
        MaskingMode::Handled,
        MaskingMode::Unhandled,
        MaskingMode::All,
    ] {
        let (binder, factory) = opened(
            ChannelShape::Request,
            FakeBehavior::default(),
            BinderSettings::default(),
        )
        .await;
        let result = binder
            .request(
                Message::new("late"),
                TimeoutBudget::new(Duration::ZERO),
                masking,
            )
            .await;
        if masking.masks_handled() {
            assert!(result.unwrap().is_none(), "{masking:?} must swallow the timeout");
        } else {
            let err = result.unwrap_err();
            assert!(err.is_timeout(), "{masking:?} must surface the timeout");
            assert_eq!(err.code(), codes::BINDER_TIMEOUT);
        }
        assert_eq!(factory.created(), 0);
    }
}

#[tokio::test]
async fn tolerated_channel_fault_reconnects_and_reports_connection_lost() {
    let (binder, factory) = opened(
        ChannelShape::Request,
        FakeBehavior::default(),
        BinderSettings::default(),
    )
    .await;
    let lost = Arc::new(AtomicUsize::new(0));
    {
        let lost = lost.clone();
        binder.on_connection_lost(move || {
            lost.fetch_add(1, Ordering::SeqCst);
        });
    }

    binder
        .request(Message::new("a"), budget(), MaskingMode::None)
        .await
        .unwrap();
    factory.channels()[0].force_fault();

    let swallowed = binder
        .request(Message::new("b"), budget(), MaskingMode::None)
        .await
        .unwrap();
    assert!(swallowed.is_none());
    assert_eq!(lost.load(Ordering::SeqCst), 1);

    let reply = binder
        .request(Message::new("c"), budget(), MaskingMode::None)
        .await
        .unwrap()
        .expect("fresh channel answers");
    assert_eq!(reply.body().as_ref(), b"C");
    assert_eq!(factory.created(), 2);
    assert_eq!(binder.state(), CommunicationState::Opened);
}

#[tokio::test]
async fn intolerant_binder_faults_when_its_channel_faults() {
    let settings = BinderSettings::default().with_tolerate_faults(TolerateFaultsMode::Never);
    let (binder, factory) = opened(ChannelShape::Request, FakeBehavior::default(), settings).await;
    assert_eq!(factory.created(), 1);
    assert!(!binder.tolerate_faults());

    let faulted = Arc::new(AtomicUsize::new(0));
    {
        let faulted = faulted.clone();
        binder.on_faulted(move |_| {
            faulted.fetch_add(1, Ordering::SeqCst);
        });
    }
    factory.stats().push_failure(FakeFailure::FaultChannel);
    let err = binder
        .request(Message::new("a"), budget(), MaskingMode::None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), codes::COMMUNICATION);
    assert_eq!(binder.state(), CommunicationState::Faulted);
    assert_eq!(faulted.load(Ordering::SeqCst), 1);

    let err = binder
        .send(Message::new("b"), budget(), MaskingMode::None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), codes::BINDER_FAULTED);
    assert!(binder
        .send(Message::new("c"), budget(), MaskingMode::All)
        .await
        .is_ok());
}

#[tokio::test]
async fn masked_timeout_from_inner_channel_returns_none() {
    let (binder, factory) = opened(
        ChannelShape::Request,
        FakeBehavior::default(),
        BinderSettings::default(),
    )
    .await;
    factory.stats().push_failure(FakeFailure::Timeout);
    assert!(binder
        .request(Message::new("a"), budget(), MaskingMode::Handled)
        .await
        .unwrap()
        .is_none());

    factory.stats().push_failure(FakeFailure::Protocol);
    let err = binder
        .request(Message::new("b"), budget(), MaskingMode::Handled)
        .await
        .unwrap_err();
    assert!(err.is_protocol_violation());
}

#[tokio::test(flavor = "multi_thread")]
async fn duplex_pump_queues_unsolicited_messages() {
    let (binder, factory) = opened(
        ChannelShape::Duplex,
        FakeBehavior::default(),
        BinderSettings::default(),
    )
    .await;
    assert!(binder.ensure_channel(budget()).await.unwrap());
    factory.channels()[0].deliver(Message::new("push"));

    match binder.try_receive(budget(), MaskingMode::None).await.unwrap() {
        ReceiveOutcome::Message(message) => assert_eq!(message.body().as_ref(), b"push"),
        other => panic!("unexpected outcome {other:?}"),
    }
    let outcome = binder
        .try_receive(TimeoutBudget::new(Duration::from_millis(20)), MaskingMode::None)
        .await
        .unwrap();
    assert!(matches!(outcome, ReceiveOutcome::TimedOut));
    binder.abort();
}

#[tokio::test(flavor = "multi_thread")]
async fn duplex_read_eof_recycles_the_channel() {
    let (binder, factory) = opened(
        ChannelShape::Duplex,
        FakeBehavior::default(),
        BinderSettings::default(),
    )
    .await;
    binder
        .request(Message::new("one"), budget(), MaskingMode::None)
        .await
        .unwrap();
    factory.channels()[0].end_input();
    let stats = factory.stats().clone();
    assert!(eventually(|| stats.closed() == 1).await);

    let reply = binder
        .request(Message::new("two"), budget(), MaskingMode::None)
        .await
        .unwrap()
        .expect("reply over the replacement channel");
    assert_eq!(reply.body().as_ref(), b"TWO");
    assert_eq!(factory.created(), 2);
    binder.close(budget(), MaskingMode::None).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn duplex_session_close_runs_the_output_handshake() {
    let (binder, factory) = opened(
        ChannelShape::DuplexSession,
        FakeBehavior::default(),
        BinderSettings::default(),
    )
    .await;
    binder
        .send(Message::new("hello"), budget(), MaskingMode::None)
        .await
        .unwrap();
    assert!(binder.has_session());
    assert!(binder.session_id().is_some());

    binder.close(budget(), MaskingMode::None).await.unwrap();
    let channel = &factory.channels()[0];
    assert!(channel.output_closed());
    assert_eq!(factory.stats().closed(), 1);
    assert_eq!(binder.state(), CommunicationState::Closed);
    assert!(matches!(
        binder.try_receive(budget(), MaskingMode::None).await.unwrap(),
        ReceiveOutcome::Closed
    ));
}

#[tokio::test]
async fn aborting_the_current_channel_forces_a_new_one() {
    let (binder, factory) = opened(
        ChannelShape::Request,
        FakeBehavior::default(),
        BinderSettings::default(),
    )
    .await;
    binder
        .request(Message::new("a"), budget(), MaskingMode::None)
        .await
        .unwrap();
    binder.abort_current_channel().unwrap();
    assert_eq!(factory.stats().aborted(), 1);

    binder
        .request(Message::new("b"), budget(), MaskingMode::None)
        .await
        .unwrap();
    assert_eq!(factory.created(), 2);
}

#[tokio::test]
async fn preinstalled_channel_is_used_without_the_factory() {
    let factory = Arc::new(FakeFactory::new(ChannelShape::Request, FakeBehavior::default()));
    let binder = ClientReliableChannelBinder::create(
        factory.clone(),
        EndpointAddress::new("net.tcp://service.example/orders"),
        BinderSettings::default(),
    )
    .unwrap();
    let channel = factory.detached();
    spark_session::InnerChannel::open(channel.as_ref(), budget())
        .await
        .unwrap();
    assert!(binder.set_channel(FakeFactory::wrap(channel.clone())).unwrap());
    assert!(!binder.set_channel(FakeFactory::wrap(factory.detached())).unwrap());

    binder.open(budget()).await.unwrap();
    binder
        .request(Message::new("a"), budget(), MaskingMode::None)
        .await
        .unwrap();
    assert_eq!(factory.created(), 0);
}

#[tokio::test]
async fn mismatched_factory_shape_is_rejected() {
    let factory = Arc::new(FakeFactory::mismatched(ChannelShape::Request, ChannelShape::Duplex));
    let binder = ClientReliableChannelBinder::create(
        factory,
        EndpointAddress::new("net.tcp://service.example/orders"),
        BinderSettings::default(),
    )
    .unwrap();
    binder.open(budget()).await.unwrap();
    let err = binder
        .request(Message::new("a"), budget(), MaskingMode::None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), codes::BINDER_INVALID_ARGUMENT);
}

#[tokio::test(flavor = "multi_thread")]
async fn close_waits_for_the_lease_holder() {
    let behavior = FakeBehavior {
        op_delay: Duration::from_millis(150),
        ..FakeBehavior::default()
    };
    let (binder, factory) = opened(ChannelShape::Request, behavior, BinderSettings::default()).await;
    let holder = {
        let binder = binder.clone();
        tokio::spawn(async move {
            binder
                .request(Message::new("slow"), budget(), MaskingMode::None)
                .await
        })
    };
    let stats = factory.stats().clone();
    assert!(eventually(|| factory.created() == 1).await);

    let err = binder
        .wait_for_pending_operations(TimeoutBudget::new(Duration::from_millis(10)))
        .await
        .unwrap_err();
    assert!(err.is_timeout());

    binder.close(budget(), MaskingMode::None).await.unwrap();
    assert!(holder.await.unwrap().unwrap().is_some());
    assert_eq!(stats.closed(), 1);
}

#[tokio::test]
async fn default_timeouts_come_from_settings() {
    let settings = BinderSettings::default()
        .with_default_send_timeout(Duration::from_secs(1))
        .with_default_close_timeout(Duration::from_secs(1))
        .with_default_masking_mode(MaskingMode::All);
    let (binder, factory) = opened(ChannelShape::Request, FakeBehavior::default(), settings).await;
    factory.stats().push_failure(FakeFailure::Communication);
    binder.send_with_defaults(Message::new("dropped")).await.unwrap();
    binder.send_with_defaults(Message::new("kept")).await.unwrap();
    binder.close_with_defaults().await.unwrap();
    assert_eq!(factory.stats().sent().len(), 1);
}

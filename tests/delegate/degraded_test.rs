//! A delegate with no module behind it.

use veil::delegate::{DelegateError, DelegateState, LifecycleDelegate, LifecycleEvent};
use veil::lifecycle::AttachContext;

fn degraded() -> LifecycleDelegate {
    let mut delegate = LifecycleDelegate::new();
    delegate
        .attach(None, &AttachContext::new().with_param("url", "https://example.invalid"))
        .expect("attach");
    delegate
}

#[test]
fn every_forward_is_accepted_and_state_stays_unattached() {
    let mut delegate = degraded();

    delegate.forward_create(Some(b"saved"));
    delegate.forward_start();
    delegate.forward_resume();
    assert!(delegate.forward_back_request());
    delegate.forward_activity_result(1, 2, Some(b"data"));
    delegate.forward_pause();
    delegate.forward_stop();
    delegate.forward_destroy();

    assert_eq!(delegate.state(), DelegateState::Unattached);
    assert!(!delegate.has_module());
}

#[test]
fn back_request_defaults_to_host_navigation_in_every_phase() {
    let mut delegate = degraded();
    assert!(delegate.forward_back_request());
    delegate.forward_create(None);
    assert!(delegate.forward_back_request());
    delegate.forward_start();
    delegate.forward_resume();
    assert!(delegate.forward_back_request());
    delegate.forward_activity_result(0, 0, None);
    delegate.forward_pause();
    delegate.forward_stop();
    delegate.forward_destroy();
    assert!(delegate.forward_back_request());
    assert_eq!(delegate.state(), DelegateState::Unattached);
}

#[test]
fn attach_event_through_dispatch_leaves_degraded_delegate_alone() {
    let mut delegate = degraded();
    let ctx = AttachContext::new();
    assert!(delegate.dispatch(LifecycleEvent::Attach(&ctx)));
    assert_eq!(delegate.state(), DelegateState::Unattached);
    assert!(!delegate.has_module());
}

#[test]
fn degraded_delegate_still_rejects_second_attach() {
    let mut delegate = degraded();
    assert_eq!(
        delegate.attach(None, &AttachContext::new()),
        Err(DelegateError::AlreadyAttached)
    );
}

//! Push routing tests
//!
//! Unsolicited frames go through the multiplexer to every matching
//! subscription, filtered by kind and optionally by device serial.


use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use nmlink_core::{FrameDisposition, PushDispatcher, SubscriptionFilter};
use test_utils::harness;

fn counting(dispatcher: &PushDispatcher, filter: SubscriptionFilter) -> Arc<AtomicUsize> {
    let count = Arc::new(AtomicUsize::new(0));
    let hits = Arc::clone(&count);
    dispatcher.subscribe(filter, move |_| {
        hits.fetch_add(1, Ordering::SeqCst);
    });
    count
}

#[test]
fn test_state_report_reaches_kind_and_device_subscribers() {
    let (_channel, mux, _outbound) = harness();
    let dispatcher = mux.dispatcher();

    let any_device = counting(dispatcher, SubscriptionFilter::kind("state_report"));
    let any_device_again = counting(dispatcher, SubscriptionFilter::kind("state_report"));
    let device_x = counting(
        dispatcher,
        SubscriptionFilter::kind("state_report").for_device("X"),
    );
    let device_y = counting(
        dispatcher,
        SubscriptionFilter::kind("state_report").for_device("Y"),
    );
    let other_kind = counting(dispatcher, SubscriptionFilter::kind("ship_update"));

    let disposition =
        mux.on_frame_received(r#"{"type":"state_report","sn":"X","data":{"azimuth":181.5}}"#);

    assert_eq!(disposition, FrameDisposition::Pushed { delivered: 3 });
    assert_eq!(any_device.load(Ordering::SeqCst), 1);
    assert_eq!(any_device_again.load(Ordering::SeqCst), 1);
    assert_eq!(device_x.load(Ordering::SeqCst), 1);
    assert_eq!(device_y.load(Ordering::SeqCst), 0);
    assert_eq!(other_kind.load(Ordering::SeqCst), 0);
}

#[test]
fn test_nested_serial_is_used_for_device_filter() {
    let (_channel, mux, _outbound) = harness();
    let device_x = counting(
        mux.dispatcher(),
        SubscriptionFilter::kind("latest_report_data").for_device("X"),
    );

    mux.on_frame_received(r#"{"message":{"type":"latest_report_data","data":{"sn":"X"}}}"#);
    mux.on_frame_received(r#"{"type":"latest_report_data","data":{"sn":"Z"}}"#);

    assert_eq!(device_x.load(Ordering::SeqCst), 1);
}

#[test]
fn test_view_teardown_leaves_other_views_subscribed() {
    let (_channel, mux, _outbound) = harness();
    let dispatcher = mux.dispatcher();

    let map_view = Arc::new(AtomicUsize::new(0));
    let hits = Arc::clone(&map_view);
    let map_handle = dispatcher.subscribe(SubscriptionFilter::kind("gis_update_data"), move |_| {
        hits.fetch_add(1, Ordering::SeqCst);
    });
    let table_view = counting(dispatcher, SubscriptionFilter::kind("gis_update_data"));

    mux.on_frame_received(r#"{"type":"gis_update_data","data":[]}"#);
    assert!(dispatcher.unsubscribe(map_handle));
    mux.on_frame_received(r#"{"type":"gis_update_data","data":[]}"#);

    assert_eq!(map_view.load(Ordering::SeqCst), 1);
    assert_eq!(table_view.load(Ordering::SeqCst), 2);
}

use pcm_iodev::control::{DeviceEvent, spawn_event_pump};
use pcm_iodev::iodev::loopback::LoopbackType;
use pcm_iodev::{AudioFormat, DeviceList, Direction, Iodev, SampleFormat};

#[tokio::test]
async fn events_are_applied_in_order() {
    let list = DeviceList::new();
    let a = list.add_device("a", Direction::Output);
    let b = list.add_device("b", Direction::Output);
    let (tx, handle) = spawn_event_pump(list.clone());

    tx.send(DeviceEvent::Enabled(a)).await.unwrap();
    tx.send(DeviceEvent::Enabled(b)).await.unwrap();
    tx.send(DeviceEvent::Started(b, true)).await.unwrap();
    tx.send(DeviceEvent::Disabled(a)).await.unwrap();
    tx.send(DeviceEvent::Enabled(999)).await.unwrap();
    drop(tx);
    handle.await.unwrap();

    assert_eq!(list.first_enabled(Direction::Output), Some(b));
    assert!(list.is_running(b));
    assert!(!list.is_running(a));
    assert!(list.device(999).is_none());
}

#[tokio::test]
async fn loopback_tracks_events_from_the_pump() {
    let list = DeviceList::new();
    let out = list.add_device("speaker", Direction::Output);
    let mut lb = Iodev::loopback(&list, LoopbackType::PostDsp);
    lb.configure(&AudioFormat::new(SampleFormat::S16LE, 48000, 2))
        .unwrap();
    let (tx, handle) = spawn_event_pump(list.clone());

    tx.send(DeviceEvent::Enabled(out)).await.unwrap();
    tx.send(DeviceEvent::Started(out, true)).await.unwrap();
    drop(tx);
    handle.await.unwrap();

    assert_eq!(list.hook_count(out), 1);
    lb.close().unwrap();
    assert_eq!(list.hook_count(out), 0);
}

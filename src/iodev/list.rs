use super::loopback::{LoopbackType, TapPoint};
use super::{DeviceId, DeviceInfo};
use crate::format::{AudioFormat, Direction};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

pub type HookId = u64;
/// Receives `(bytes, frames, format)` of a commit and returns the frames it kept.
pub type SampleHook = Box<dyn FnMut(&[u8], usize, &AudioFormat) -> usize + Send>;
pub type StartHook = Box<dyn FnMut(bool) + Send>;
pub type EnabledCallback = Arc<dyn Fn(&DeviceInfo, bool) + Send + Sync>;

struct LoopbackHook {
    id: HookId,
    kind: LoopbackType,
    sender: DeviceId,
    receiver: DeviceId,
    on_samples: SampleHook,
    on_start: StartHook,
}

#[derive(Default)]
struct Registry {
    next_device: DeviceId,
    devices: BTreeMap<DeviceId, DeviceInfo>,
    /// Enabled devices in the order they were enabled.
    enabled: Vec<DeviceId>,
    running: HashSet<DeviceId>,
    callbacks: Vec<(DeviceId, EnabledCallback)>,
}

#[derive(Default)]
struct Hooks {
    next_id: HookId,
    entries: Vec<LoopbackHook>,
}

/// Devices known to the server, which of them are enabled, and the
/// loopback taps attached to them.
#[derive(Default)]
pub struct DeviceList {
    registry: Mutex<Registry>,
    hooks: Mutex<Hooks>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl DeviceList {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_device(&self, name: &str, direction: Direction) -> DeviceId {
        let mut reg = lock(&self.registry);
        reg.next_device += 1;
        let id = reg.next_device;
        reg.devices.insert(
            id,
            DeviceInfo {
                id,
                name: name.to_string(),
                direction,
            },
        );
        debug!("added {direction:?} device {id} '{name}'");
        id
    }

    /// Forgets the device, detaching every tap that reads from or feeds it.
    pub fn remove_device(&self, id: DeviceId) {
        let was_enabled = lock(&self.registry).enabled.contains(&id);
        if was_enabled {
            self.disable(id);
        }
        lock(&self.hooks)
            .entries
            .retain(|h| h.sender != id && h.receiver != id);
        let mut reg = lock(&self.registry);
        reg.devices.remove(&id);
        reg.running.remove(&id);
        reg.callbacks.retain(|(owner, _)| *owner != id);
    }

    pub fn device(&self, id: DeviceId) -> Option<DeviceInfo> {
        lock(&self.registry).devices.get(&id).cloned()
    }

    pub fn devices(&self) -> Vec<DeviceInfo> {
        lock(&self.registry).devices.values().cloned().collect()
    }

    pub fn is_enabled(&self, id: DeviceId) -> bool {
        lock(&self.registry).enabled.contains(&id)
    }

    pub fn first_enabled(&self, direction: Direction) -> Option<DeviceId> {
        let reg = lock(&self.registry);
        reg.enabled
            .iter()
            .copied()
            .find(|id| reg.devices.get(id).is_some_and(|d| d.direction == direction))
    }

    pub fn enable(&self, id: DeviceId) -> bool {
        let info = {
            let mut reg = lock(&self.registry);
            let Some(info) = reg.devices.get(&id).cloned() else {
                warn!("enable: unknown device {id}");
                return false;
            };
            if reg.enabled.contains(&id) {
                return true;
            }
            reg.enabled.push(id);
            info
        };
        self.notify(&info, true);
        true
    }

    pub fn disable(&self, id: DeviceId) -> bool {
        let info = {
            let mut reg = lock(&self.registry);
            let Some(pos) = reg.enabled.iter().position(|&e| e == id) else {
                return false;
            };
            reg.enabled.remove(pos);
            match reg.devices.get(&id).cloned() {
                Some(info) => info,
                None => return true,
            }
        };
        self.notify(&info, false);
        true
    }

    // Callbacks run without the registry lock so they may query or modify it.
    fn notify(&self, info: &DeviceInfo, enabled: bool) {
        let callbacks: Vec<EnabledCallback> = lock(&self.registry)
            .callbacks
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for cb in callbacks {
            cb(info, enabled);
        }
    }

    /// Installs `owner`'s enabled/disabled callback, replacing any previous one.
    pub fn set_device_enabled_callback(&self, owner: DeviceId, cb: EnabledCallback) {
        let mut reg = lock(&self.registry);
        reg.callbacks.retain(|(o, _)| *o != owner);
        reg.callbacks.push((owner, cb));
    }

    pub fn clear_device_enabled_callback(&self, owner: DeviceId) {
        lock(&self.registry).callbacks.retain(|(o, _)| *o != owner);
    }

    /// Attaches a tap to `sender`. If the sender is already running, the
    /// start hook is told so before this returns.
    pub fn register_loopback(
        &self,
        kind: LoopbackType,
        sender: DeviceId,
        receiver: DeviceId,
        on_samples: SampleHook,
        mut on_start: StartHook,
    ) -> HookId {
        let mut hooks = lock(&self.hooks);
        if self.is_running(sender) {
            on_start(true);
        }
        hooks.next_id += 1;
        let id = hooks.next_id;
        hooks.entries.push(LoopbackHook {
            id,
            kind,
            sender,
            receiver,
            on_samples,
            on_start,
        });
        debug!("loopback {kind:?} from device {sender} to {receiver} as hook {id}");
        id
    }

    /// Once this returns the hook is gone and is not running on any thread.
    pub fn unregister_loopback(&self, id: HookId) -> bool {
        let mut hooks = lock(&self.hooks);
        let before = hooks.entries.len();
        hooks.entries.retain(|h| h.id != id);
        hooks.entries.len() != before
    }

    pub fn hook_count(&self, sender: DeviceId) -> usize {
        lock(&self.hooks)
            .entries
            .iter()
            .filter(|h| h.sender == sender)
            .count()
    }

    /// Feeds committed samples of `sender` to every tap at `point`.
    pub fn run_sample_hooks(
        &self,
        sender: DeviceId,
        point: TapPoint,
        bytes: &[u8],
        frames: usize,
        fmt: &AudioFormat,
    ) {
        let mut hooks = lock(&self.hooks);
        for hook in hooks
            .entries
            .iter_mut()
            .filter(|h| h.sender == sender && h.kind.tap_point() == point)
        {
            let copied = (hook.on_samples)(bytes, frames, fmt);
            if copied < frames {
                debug!(
                    "loopback hook {} dropped {} frames",
                    hook.id,
                    frames - copied
                );
            }
        }
    }

    pub fn is_running(&self, id: DeviceId) -> bool {
        lock(&self.registry).running.contains(&id)
    }

    /// Records that `sender` started or stopped and tells its taps.
    pub fn set_device_started(&self, sender: DeviceId, started: bool) {
        {
            let mut reg = lock(&self.registry);
            if started {
                reg.running.insert(sender);
            } else {
                reg.running.remove(&sender);
            }
        }
        self.run_start_hooks(sender, started);
    }

    pub fn run_start_hooks(&self, sender: DeviceId, started: bool) {
        let mut hooks = lock(&self.hooks);
        for hook in hooks.entries.iter_mut().filter(|h| h.sender == sender) {
            (hook.on_start)(started);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::SampleFormat;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[test]
    fn first_enabled_follows_enable_order() {
        let list = DeviceList::new();
        let a = list.add_device("a", Direction::Output);
        let b = list.add_device("b", Direction::Output);
        let mic = list.add_device("mic", Direction::Input);
        assert_eq!(list.first_enabled(Direction::Output), None);

        list.enable(mic);
        list.enable(b);
        list.enable(a);
        assert_eq!(list.first_enabled(Direction::Output), Some(b));
        assert_eq!(list.first_enabled(Direction::Input), Some(mic));

        list.disable(b);
        assert_eq!(list.first_enabled(Direction::Output), Some(a));
        assert!(!list.disable(b));
    }

    #[test]
    fn callbacks_see_enable_and_disable() {
        let list = DeviceList::new();
        let out = list.add_device("out", Direction::Output);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        list.set_device_enabled_callback(
            99,
            Arc::new(move |info, enabled| sink.lock().unwrap().push((info.id, enabled))),
        );
        list.enable(out);
        list.disable(out);
        list.clear_device_enabled_callback(99);
        list.enable(out);
        assert_eq!(*seen.lock().unwrap(), vec![(out, true), (out, false)]);
    }

    #[test]
    fn hooks_only_fire_for_their_sender_and_tap_point() {
        let list = DeviceList::new();
        let out = list.add_device("out", Direction::Output);
        let other = list.add_device("other", Direction::Output);
        let frames_seen = Arc::new(AtomicUsize::new(0));
        let counter = frames_seen.clone();
        let id = list.register_loopback(
            LoopbackType::PostDsp,
            out,
            100,
            Box::new(move |_, frames, _| {
                counter.fetch_add(frames, Ordering::SeqCst);
                frames
            }),
            Box::new(|_| {}),
        );
        let fmt = AudioFormat::new(SampleFormat::S16LE, 48000, 2);
        let bytes = [0u8; 64];
        list.run_sample_hooks(out, TapPoint::PostDsp, &bytes, 16, &fmt);
        list.run_sample_hooks(out, TapPoint::PostMix, &bytes, 16, &fmt);
        list.run_sample_hooks(other, TapPoint::PostDsp, &bytes, 16, &fmt);
        assert_eq!(frames_seen.load(Ordering::SeqCst), 16);

        assert!(list.unregister_loopback(id));
        list.run_sample_hooks(out, TapPoint::PostDsp, &bytes, 16, &fmt);
        assert_eq!(frames_seen.load(Ordering::SeqCst), 16);
        assert!(!list.unregister_loopback(id));
    }

    #[test]
    fn start_state_reaches_new_and_existing_hooks() {
        let list = DeviceList::new();
        let out = list.add_device("out", Direction::Output);
        let started = Arc::new(AtomicBool::new(false));
        let flag = started.clone();
        list.register_loopback(
            LoopbackType::PostMixPreDsp,
            out,
            100,
            Box::new(|_, frames, _| frames),
            Box::new(move |s| flag.store(s, Ordering::SeqCst)),
        );
        list.set_device_started(out, true);
        assert!(started.load(Ordering::SeqCst));

        let late = Arc::new(AtomicBool::new(false));
        let late_flag = late.clone();
        list.register_loopback(
            LoopbackType::PostDsp,
            out,
            101,
            Box::new(|_, frames, _| frames),
            Box::new(move |s| late_flag.store(s, Ordering::SeqCst)),
        );
        assert!(late.load(Ordering::SeqCst));

        list.set_device_started(out, false);
        assert!(!started.load(Ordering::SeqCst));
        assert!(!late.load(Ordering::SeqCst));
    }

    #[test]
    fn removing_a_device_drops_its_hooks() {
        let list = DeviceList::new();
        let out = list.add_device("out", Direction::Output);
        list.enable(out);
        list.register_loopback(
            LoopbackType::PostDsp,
            out,
            7,
            Box::new(|_, frames, _| frames),
            Box::new(|_| {}),
        );
        assert_eq!(list.hook_count(out), 1);
        list.remove_device(out);
        assert_eq!(list.hook_count(out), 0);
        assert!(list.device(out).is_none());
        assert_eq!(list.first_enabled(Direction::Output), None);
    }
}

use crate::frame::Frame;
use parking_lot::Mutex;
use std::sync::Arc;

pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

/// Dernière Frame observée, tous liens confondus (last-write-wins, sans historique)
#[derive(Clone, Default)]
pub struct SystemState {
    latest: Shared<Option<Frame>>,
}

impl SystemState {
    pub fn new() -> Self {
        Self { latest: new_state(None) }
    }

    pub fn update(&self, frame: Frame) {
        *self.latest.lock() = Some(frame);
    }

    pub fn latest(&self) -> Option<Frame> {
        self.latest.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::parse;

    #[test]
    fn test_last_write_wins() {
        let state = SystemState::new();
        assert!(state.latest().is_none());

        state.update(parse("SEN,TEM,22.5", "dht_00").unwrap());
        state.update(parse("CMD,FLOOR,2", "ent_00").unwrap());

        let latest = state.latest().unwrap();
        assert_eq!(latest.origin, "ent_00");
        assert_eq!(latest.metric_name, "FLOOR");
    }

    #[test]
    fn test_concurrent_writers_leave_a_whole_frame() {
        let state = SystemState::new();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let state = state.clone();
                std::thread::spawn(move || {
                    for n in 0..100 {
                        let line = format!("SEN,M{i},{n}");
                        state.update(parse(&line, &format!("dev_{i}")).unwrap());
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let latest = state.latest().unwrap();
        // origine et métrique viennent toujours de la même écriture
        assert_eq!(latest.metric_name, format!("M{}", &latest.origin[4..]));
        assert_eq!(latest.value, "99");
    }
}

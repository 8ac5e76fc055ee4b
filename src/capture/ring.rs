use std::collections::VecDeque;

type EvictHook<T> = Box<dyn Fn(&T) + Send>;

/// Fixed-capacity ordered buffer with oldest-first eviction on overflow.
///
/// An optional hook observes every entry leaving the ring, whether by
/// eviction, retention filtering, or an explicit clear. The network buffer
/// uses it to delete on-disk body files.
pub struct Ring<T> {
    buf: VecDeque<T>,
    cap: usize,
    on_evict: Option<EvictHook<T>>,
}

impl<T> Ring<T> {
    pub fn new(cap: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(cap.min(1024)),
            cap: cap.max(1),
            on_evict: None,
        }
    }

    pub fn with_evict_hook(cap: usize, hook: impl Fn(&T) + Send + 'static) -> Self {
        let mut ring = Self::new(cap);
        ring.on_evict = Some(Box::new(hook));
        ring
    }

    pub fn push(&mut self, item: T) {
        if self.buf.len() == self.cap {
            if let Some(evicted) = self.buf.pop_front() {
                if let Some(hook) = &self.on_evict {
                    hook(&evicted);
                }
            }
        }
        self.buf.push_back(item);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.buf.iter()
    }

    /// First entry matching `pred`, for filling data in after insertion.
    pub fn find_mut(&mut self, mut pred: impl FnMut(&T) -> bool) -> Option<&mut T> {
        self.buf.iter_mut().find(|item| pred(item))
    }

    /// Keep only entries matching `pred`; dropped entries pass through the
    /// eviction hook.
    pub fn retain(&mut self, mut pred: impl FnMut(&T) -> bool) {
        let hook = self.on_evict.as_deref();
        self.buf.retain(|item| {
            let keep = pred(item);
            if !keep {
                if let Some(hook) = hook {
                    hook(item);
                }
            }
            keep
        });
    }

    pub fn clear(&mut self) {
        if let Some(hook) = &self.on_evict {
            for item in &self.buf {
                hook(item);
            }
        }
        self.buf.clear();
    }
}

// Present waits on these, so a slot may only be re-signalled once its image
// has been acquired again. Keying by swapchain image guarantees that.
pub struct PerImage<T> {
    slots: Vec<T>,
}

impl<T: Copy> PerImage<T> {
    pub fn new() -> Self {
        PerImage { slots: Vec::new() }
    }

    /// Grows or shrinks to `image_count`, creating or destroying only the difference.
    pub fn resize<E>(
        &mut self,
        image_count: usize,
        mut create: impl FnMut() -> Result<T, E>,
        mut destroy: impl FnMut(T),
    ) -> Result<(), E> {
        while self.slots.len() > image_count {
            if let Some(slot) = self.slots.pop() {
                destroy(slot);
            }
        }
        while self.slots.len() < image_count {
            self.slots.push(create()?);
        }
        Ok(())
    }

    pub fn for_image(&self, img_idx: u32) -> T {
        self.slots[img_idx as usize]
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.slots.drain(..)
    }
}

impl<T: Copy> Default for PerImage<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter() -> impl FnMut() -> Result<u32, ()> {
        let mut next = 0;
        move || {
            next += 1;
            Ok(next)
        }
    }

    #[test]
    fn one_slot_per_image() {
        let mut slots = PerImage::new();
        slots.resize(3, counter(), |_| {}).unwrap();
        assert_eq!(slots.len(), 3);
        // Two frames in flight, three images: frame N and N+2 land on
        // different images and must not share a slot.
        let (n, n_plus_two) = (slots.for_image(0), slots.for_image(2));
        assert_ne!(n, n_plus_two);
        let mut all = [slots.for_image(0), slots.for_image(1), slots.for_image(2)];
        all.sort();
        assert_eq!(all, [1, 2, 3]);
    }

    #[test]
    fn resize_touches_only_the_difference() {
        let mut slots = PerImage::new();
        let mut create = counter();
        slots.resize(2, &mut create, |_| {}).unwrap();
        slots.resize(2, &mut create, |_| panic!("nothing to destroy")).unwrap();
        assert_eq!(slots.len(), 2);

        slots.resize(4, &mut create, |_| {}).unwrap();
        assert_eq!(slots.for_image(3), 4);

        let mut destroyed = Vec::new();
        slots.resize(1, &mut create, |s| destroyed.push(s)).unwrap();
        assert_eq!(destroyed, vec![4, 3, 2]);
        assert_eq!(slots.for_image(0), 1);
    }

    #[test]
    fn create_failure_keeps_existing_slots() {
        let mut slots = PerImage::new();
        slots.resize(1, counter(), |_| {}).unwrap();
        let err = slots.resize(3, || Err::<u32, _>("out of memory"), |_| {});
        assert_eq!(err, Err("out of memory"));
        assert_eq!(slots.len(), 1);
    }

    #[test]
    fn drain_empties() {
        let mut slots = PerImage::new();
        slots.resize(2, counter(), |_| {}).unwrap();
        assert_eq!(slots.drain().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(slots.len(), 0);
    }
}

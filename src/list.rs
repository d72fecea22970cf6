use core::{marker::PhantomData, ptr::null_mut, ptr::NonNull};

/// A node that can be linked into a [List].
///
/// SAFETY:
/// Implementors must store the pointer passed to [Linked::set_next] verbatim and
/// return it unchanged from [Linked::next]. The pointer must not be used for
/// anything else.
pub unsafe trait Linked {
    fn next(&self) -> *mut Self;
    fn set_next(&mut self, next: *mut Self);
}

/// Intrusive singly-linked list.
///
/// The list never allocates and never owns its nodes, it only links nodes that
/// are owned elsewhere. Whoever pushes a node is responsible for keeping it
/// alive (and unmoved) until it has been popped or extracted again, and for
/// never linking it into two lists at once.
///
/// The list itself performs no locking. Queues that are fed from interrupt
/// context wrap it in a blocking mutex; the scan-based operations
/// ([List::extract], [List::extract_if], [List::insert_sorted]) must only be
/// used from the single dispatch context.
pub struct List<T: Linked> {
    first: *mut T,
    last: *mut T,
}

unsafe impl<T: Linked + Send> Send for List<T> {}

impl<T: Linked> List<T> {
    pub const fn new() -> Self {
        Self {
            first: null_mut(),
            last: null_mut(),
        }
    }
    pub fn is_empty(&self) -> bool {
        self.first.is_null()
    }
    /// Returns a reference to the head node without unlinking it.
    pub fn front(&self) -> Option<&T> {
        unsafe { self.first.as_ref() }
    }
    pub fn front_mut(&mut self) -> Option<&mut T> {
        unsafe { self.first.as_mut() }
    }
    /// Append a node at the tail.
    ///
    /// SAFETY:
    /// `node` must be valid until it is removed from the list again and must
    /// not currently be linked anywhere.
    pub unsafe fn push_back(&mut self, node: NonNull<T>) {
        let ptr = node.as_ptr();
        (*ptr).set_next(null_mut());
        if self.first.is_null() {
            self.first = ptr;
        } else {
            (*self.last).set_next(ptr);
        }
        self.last = ptr;
    }
    /// Prepend a node at the head.
    ///
    /// SAFETY:
    /// Same contract as [List::push_back].
    pub unsafe fn push_front(&mut self, node: NonNull<T>) {
        let ptr = node.as_ptr();
        if self.first.is_null() {
            self.last = ptr;
        }
        (*ptr).set_next(self.first);
        self.first = ptr;
    }
    /// Take the head node out of the list.
    pub fn pop_front(&mut self) -> Option<NonNull<T>> {
        let node = NonNull::new(self.first)?;
        unsafe {
            self.first = node.as_ref().next();
            (*node.as_ptr()).set_next(null_mut());
        }
        if self.first.is_null() {
            self.last = null_mut();
        }
        Some(node)
    }
    /// Unlink a specific node. Linear scan; returns whether it was found.
    pub fn extract(&mut self, node: NonNull<T>) -> bool {
        let target = node.as_ptr();
        if self.first.is_null() {
            return false;
        }
        unsafe {
            if self.first == target {
                self.first = (*target).next();
                (*target).set_next(null_mut());
                if self.first.is_null() {
                    self.last = null_mut();
                }
                return true;
            }
            let mut scan = self.first;
            while !(*scan).next().is_null() && (*scan).next() != target {
                scan = (*scan).next();
            }
            if (*scan).next().is_null() {
                return false;
            }
            if self.last == target {
                self.last = scan;
            }
            (*scan).set_next((*target).next());
            (*target).set_next(null_mut());
        }
        true
    }
    /// Unlink and return the first node matching `pred`.
    pub fn extract_if(&mut self, mut pred: impl FnMut(&T) -> bool) -> Option<NonNull<T>> {
        let mut prev: *mut T = null_mut();
        let mut scan = self.first;
        while let Some(node) = NonNull::new(scan) {
            unsafe {
                if pred(node.as_ref()) {
                    let next = node.as_ref().next();
                    if prev.is_null() {
                        self.first = next;
                    } else {
                        (*prev).set_next(next);
                    }
                    if self.last == scan {
                        self.last = prev;
                    }
                    (*node.as_ptr()).set_next(null_mut());
                    return Some(node);
                }
                prev = scan;
                scan = node.as_ref().next();
            }
        }
        None
    }
    pub fn contains(&self, node: NonNull<T>) -> bool {
        let mut scan = self.first;
        while !scan.is_null() {
            if scan == node.as_ptr() {
                return true;
            }
            scan = unsafe { (*scan).next() };
        }
        false
    }
    pub fn count(&self) -> usize {
        self.iter().count()
    }
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            cur: self.first,
            _marker: PhantomData,
        }
    }
    /// Insert a node before the first element for which `before(node, elem)`
    /// returns true, or at the tail if there is none. A single linear scan.
    ///
    /// SAFETY:
    /// Same contract as [List::push_back].
    pub unsafe fn insert_sorted(
        &mut self,
        node: NonNull<T>,
        mut before: impl FnMut(&T, &T) -> bool,
    ) {
        let mut prev: *mut T = null_mut();
        let mut scan = self.first;
        while !scan.is_null() {
            if before(node.as_ref(), &*scan) {
                break;
            }
            prev = scan;
            scan = (*scan).next();
        }
        if scan.is_null() {
            self.last = node.as_ptr();
        }
        (*node.as_ptr()).set_next(scan);
        if prev.is_null() {
            self.first = node.as_ptr();
        } else {
            (*prev).set_next(node.as_ptr());
        }
    }
    /// Insert `node` right after `prev`, or at the head for `None`.
    ///
    /// If `prev` is not linked in this list the node is not inserted.
    ///
    /// SAFETY:
    /// Same contract as [List::push_back].
    pub unsafe fn insert_after(&mut self, prev: Option<NonNull<T>>, node: NonNull<T>) {
        let Some(prev) = prev else {
            self.push_front(node);
            return;
        };
        if !self.contains(prev) {
            return;
        }
        (*node.as_ptr()).set_next(prev.as_ref().next());
        (*prev.as_ptr()).set_next(node.as_ptr());
        if node.as_ref().next().is_null() {
            self.last = node.as_ptr();
        }
    }
    /// Insert `node` right before `next`, or at the tail for `None`.
    ///
    /// If `next` is not linked in this list the node is not inserted.
    ///
    /// SAFETY:
    /// Same contract as [List::push_back].
    pub unsafe fn insert_before(&mut self, next: Option<NonNull<T>>, node: NonNull<T>) {
        let Some(next) = next else {
            self.push_back(node);
            return;
        };
        if self.first == next.as_ptr() {
            self.push_front(node);
            return;
        }
        let mut scan = self.first;
        while !scan.is_null() {
            if (*scan).next() == next.as_ptr() {
                (*node.as_ptr()).set_next(next.as_ptr());
                (*scan).set_next(node.as_ptr());
                return;
            }
            scan = (*scan).next();
        }
    }
    /// Append all nodes of `other`, leaving it empty.
    pub fn concat(&mut self, other: &mut List<T>) {
        if other.first.is_null() {
            return;
        }
        if self.first.is_null() {
            self.first = other.first;
        } else {
            unsafe { (*self.last).set_next(other.first) };
        }
        self.last = other.last;
        other.first = null_mut();
        other.last = null_mut();
    }
}

pub struct Iter<'a, T: Linked> {
    cur: *mut T,
    _marker: PhantomData<&'a T>,
}
impl<'a, T: Linked> Iterator for Iter<'a, T> {
    type Item = &'a T;
    fn next(&mut self) -> Option<Self::Item> {
        let node = NonNull::new(self.cur)?;
        self.cur = unsafe { node.as_ref().next() };
        Some(unsafe { &*node.as_ptr() })
    }
}

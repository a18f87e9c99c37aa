// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! Getter/setter pairs focusing on part of a model.
use std::{fmt, sync::Arc};

type Getter<P, C> = Arc<dyn Fn(&P) -> C + Send + Sync>;
type Setter<P, C> = Arc<dyn Fn(&mut P, C) + Send + Sync>;

/// Focuses on a `C` inside a `P`.
///
/// Child stores see their parent's model through a lens: reading the child is `get` on the
/// parent, and mutating the child is `get`, mutate, then `set` back, as one mutation of the
/// parent.
///
/// ```rust
/// # use reflux::{Lens, field_lens};
/// #[derive(Clone, Default)]
/// struct Address { street: String }
/// #[derive(Clone, Default)]
/// struct User { address: Address }
///
/// let street = field_lens!(User, address).then(field_lens!(Address, street));
/// let mut user = User::default();
/// street.over(&mut user, |s| s.push_str("Main St"));
/// assert_eq!(street.get(&user), "Main St");
/// ```
pub struct Lens<P, C> {
    get: Getter<P, C>,
    set: Setter<P, C>,
}

impl<P, C> Clone for Lens<P, C> {
    fn clone(&self) -> Self {
        Self {
            get: Arc::clone(&self.get),
            set: Arc::clone(&self.set),
        }
    }
}

impl<P, C> fmt::Debug for Lens<P, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Lens<{}, {}>",
            std::any::type_name::<P>(),
            std::any::type_name::<C>()
        )
    }
}

impl<P: 'static, C: 'static> Lens<P, C> {
    pub fn new(
        get: impl Fn(&P) -> C + Send + Sync + 'static,
        set: impl Fn(&mut P, C) + Send + Sync + 'static,
    ) -> Self {
        Self {
            get: Arc::new(get),
            set: Arc::new(set),
        }
    }

    /// The focused value.
    pub fn get(&self, parent: &P) -> C {
        (self.get)(parent)
    }

    /// Replaces the focused value.
    pub fn set(&self, parent: &mut P, child: C) {
        (self.set)(parent, child)
    }

    /// Modifies the focused value in place.
    pub fn over<R>(&self, parent: &mut P, f: impl FnOnce(&mut C) -> R) -> R {
        let mut child = self.get(parent);
        let result = f(&mut child);
        self.set(parent, child);
        result
    }

    /// Composes this lens with one focusing further into `C`.
    pub fn then<D: 'static>(&self, inner: Lens<C, D>) -> Lens<P, D> {
        let outer_get = self.clone();
        let outer_set = self.clone();
        let inner_set = inner.clone();
        Lens::new(
            move |parent| inner.get(&outer_get.get(parent)),
            move |parent, value| outer_set.over(parent, |child| inner_set.set(child, value)),
        )
    }
}

impl<P: Clone + 'static> Lens<P, P> {
    /// The lens focusing on the whole value.
    pub fn identity() -> Self {
        Lens::new(P::clone, |parent, value| *parent = value)
    }
}

/// Builds a [`Lens`] onto a (possibly nested) field: `field_lens!(User, address.street)`.
#[macro_export]
macro_rules! field_lens {
    ($parent:ty, $($field:ident).+) => {
        $crate::Lens::new(
            |parent: &$parent| parent.$($field).+.clone(),
            |parent: &mut $parent, value| parent.$($field).+ = value,
        )
    };
}

//! Page model shared by every store layer.
//!
//! A page is an opaque unit of per-session UI state. Stores pass pages around
//! as [`PageRef`] (`Arc<dyn ManageablePage>`); instance identity is part of
//! the contract, so two handles refer to "the same page" only when
//! [`same_page`] says so, regardless of their ids.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::error::PageError;

/// Page identifier, unique within a session.
pub type PageId = u32;

/// Shared handle to a page.
pub type PageRef = Arc<dyn ManageablePage>;

/// A page that can be managed by a page store.
pub trait ManageablePage: fmt::Debug + Send + Sync + 'static {
    /// Id of the page within its session.
    fn page_id(&self) -> PageId;

    /// Whether the page can be regenerated without stored state.
    ///
    /// Evaluating this may call into arbitrary page code and can fail.
    fn is_page_stateless(&self) -> Result<bool, PageError>;

    /// Human-readable type name, used by store browsers.
    fn page_type(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Downcasting hook for stores that understand concrete page types.
    fn as_any(&self) -> &dyn Any;
}

/// Instance identity of two page handles.
///
/// Compares data pointers only; vtable pointers of the same type may differ
/// across codegen units.
#[must_use]
pub fn same_page(a: &PageRef, b: &PageRef) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Downcast a page handle to a concrete page type.
#[must_use]
pub fn downcast_page<T: ManageablePage>(page: &PageRef) -> Option<&T> {
    page.as_any().downcast_ref::<T>()
}

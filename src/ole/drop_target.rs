//! Drop-target interception

use std::sync::Arc;

use windows::core::{implement, w};
use windows::Win32::Foundation::{E_FAIL, E_INVALIDARG, HWND, POINTL};
use windows::Win32::System::Com::IDataObject;
use windows::Win32::System::Ole::{
    IDropTarget, IDropTarget_Impl, RegisterDragDrop, RevokeDragDrop, DROPEFFECT, DROPEFFECT_NONE,
};
use windows::Win32::System::SystemServices::MODIFIERKEYS_FLAGS;
use windows::Win32::UI::WindowsAndMessaging::GetPropW;
use windows_core::{Interface, Ref};

use super::{window_id, CarrierDataObject, OleCarrier};
use crate::carrier::Carrier;
use crate::error::{DropError, Result};
use crate::hooks::{FileRelocator, ScriptHooks};
use crate::manager::DropManager;
use crate::session::{DropEffect, DropSession, HostDropTarget, KeyState, Point};

/// The window's original `IDropTarget`, driven by the session
pub struct OleHostTarget {
    target: IDropTarget,
}

// Only called from the window's thread, inside the drag protocol
unsafe impl Send for OleHostTarget {}
unsafe impl Sync for OleHostTarget {}

impl OleHostTarget {
    pub fn new(target: IDropTarget) -> Self {
        Self { target }
    }
}

fn host_error(call: &str, e: windows_core::Error) -> DropError {
    DropError::HostProtocolFailure(format!("{call}: {e}"))
}

impl HostDropTarget for OleHostTarget {
    fn drag_enter(&self, carrier: &Carrier, key_state: KeyState, point: Point, allowed: DropEffect) -> Result<DropEffect> {
        let data = CarrierDataObject::for_carrier(carrier);
        let mut effect = DROPEFFECT(allowed.0);
        unsafe {
            self.target
                .DragEnter(&data, MODIFIERKEYS_FLAGS(key_state.0), pointl(point), &mut effect)
                .map_err(|e| host_error("DragEnter", e))?;
        }
        Ok(DropEffect(effect.0))
    }

    fn drag_over(&self, key_state: KeyState, point: Point, allowed: DropEffect) -> Result<DropEffect> {
        let mut effect = DROPEFFECT(allowed.0);
        unsafe {
            self.target
                .DragOver(MODIFIERKEYS_FLAGS(key_state.0), pointl(point), &mut effect)
                .map_err(|e| host_error("DragOver", e))?;
        }
        Ok(DropEffect(effect.0))
    }

    fn drag_leave(&self) -> Result<()> {
        unsafe { self.target.DragLeave() }.map_err(|e| host_error("DragLeave", e))
    }

    fn drop_data(&self, carrier: &Carrier, key_state: KeyState, point: Point, allowed: DropEffect) -> Result<DropEffect> {
        let data = CarrierDataObject::for_carrier(carrier);
        let mut effect = DROPEFFECT(allowed.0);
        unsafe {
            self.target
                .Drop(&data, MODIFIERKEYS_FLAGS(key_state.0), pointl(point), &mut effect)
                .map_err(|e| host_error("Drop", e))?;
        }
        Ok(DropEffect(effect.0))
    }
}

fn pointl(point: Point) -> POINTL {
    POINTL { x: point.x, y: point.y }
}

/// What OLE calls instead of the window's own target
#[implement(IDropTarget)]
pub struct WrappedDropTarget {
    session: Arc<DropSession>,
}

impl WrappedDropTarget {
    pub fn new(session: Arc<DropSession>) -> Self {
        Self { session }
    }
}

/// Write the session's answer into `pdweffect`; failures become NONE.
unsafe fn answer(pdweffect: *mut DROPEFFECT, result: Result<DropEffect>) -> windows_core::Result<()> {
    match result {
        Ok(effect) => {
            *pdweffect = DROPEFFECT(effect.0);
            Ok(())
        }
        Err(e) => {
            log::error!("[Windows] drag event failed: {}", e);
            *pdweffect = DROPEFFECT_NONE;
            Err(windows_core::Error::from_hresult(E_FAIL))
        }
    }
}

fn carrier_from(pdataobj: Ref<'_, IDataObject>) -> windows_core::Result<Carrier> {
    let data = pdataobj
        .as_ref()
        .ok_or_else(|| windows_core::Error::from_hresult(E_INVALIDARG))?;
    Ok(Arc::new(OleCarrier::new(data.clone())))
}

impl IDropTarget_Impl for WrappedDropTarget_Impl {
    fn DragEnter(
        &self,
        pdataobj: Ref<'_, IDataObject>,
        grfkeystate: MODIFIERKEYS_FLAGS,
        pt: &POINTL,
        pdweffect: *mut DROPEFFECT,
    ) -> windows_core::Result<()> {
        if pdweffect.is_null() {
            return Err(windows_core::Error::from_hresult(E_INVALIDARG));
        }
        let carrier = carrier_from(pdataobj)?;
        unsafe {
            let allowed = DropEffect((*pdweffect).0);
            let result = self
                .session
                .drag_enter(carrier, KeyState(grfkeystate.0), Point::new(pt.x, pt.y), allowed);
            answer(pdweffect, result)
        }
    }

    fn DragOver(&self, grfkeystate: MODIFIERKEYS_FLAGS, pt: &POINTL, pdweffect: *mut DROPEFFECT) -> windows_core::Result<()> {
        if pdweffect.is_null() {
            return Err(windows_core::Error::from_hresult(E_INVALIDARG));
        }
        unsafe {
            let allowed = DropEffect((*pdweffect).0);
            let result = self
                .session
                .drag_over(KeyState(grfkeystate.0), Point::new(pt.x, pt.y), allowed);
            answer(pdweffect, result)
        }
    }

    fn DragLeave(&self) -> windows_core::Result<()> {
        self.session.drag_leave().map_err(|e| {
            log::error!("[Windows] DragLeave failed: {}", e);
            windows_core::Error::from_hresult(E_FAIL)
        })
    }

    fn Drop(
        &self,
        pdataobj: Ref<'_, IDataObject>,
        grfkeystate: MODIFIERKEYS_FLAGS,
        pt: &POINTL,
        pdweffect: *mut DROPEFFECT,
    ) -> windows_core::Result<()> {
        if pdweffect.is_null() {
            return Err(windows_core::Error::from_hresult(E_INVALIDARG));
        }
        let carrier = carrier_from(pdataobj)?;
        unsafe {
            let allowed = DropEffect((*pdweffect).0);
            let result = self
                .session
                .drop_data(carrier, KeyState(grfkeystate.0), Point::new(pt.x, pt.y), allowed);
            answer(pdweffect, result)
        }
    }
}

/// An installed interception. [`remove`](Interception::remove) puts the
/// original target back.
pub struct Interception {
    hwnd: HWND,
    original: IDropTarget,
}

impl Interception {
    pub fn hwnd(&self) -> HWND {
        self.hwnd
    }

    pub fn remove(self, manager: &DropManager) -> Result<()> {
        manager.unregister(window_id(self.hwnd));
        unsafe {
            let _ = RevokeDragDrop(self.hwnd);
            RegisterDragDrop(self.hwnd, &self.original).map_err(|e| host_error("RegisterDragDrop", e))?;
        }
        log::info!("[Windows] restored original drop target on {:?}", self.hwnd);
        Ok(())
    }
}

/// Swap the window's registered `IDropTarget` for one that routes through a
/// new session. The window must already have called `RegisterDragDrop`.
pub fn install_drop_target(
    hwnd: HWND,
    manager: &DropManager,
    hooks: Option<Arc<dyn ScriptHooks>>,
    relocator: Option<Arc<dyn FileRelocator>>,
) -> Result<Interception> {
    // OLE keeps the registered target in this window property
    let original = unsafe {
        let raw = GetPropW(hwnd, w!("OleDropTargetInterface"));
        IDropTarget::from_raw_borrowed(&raw.0).cloned()
    }
    .ok_or_else(|| DropError::InvalidArgument(format!("{hwnd:?} has no registered drop target")))?;

    let mut session = DropSession::new(manager.context().clone(), Arc::new(OleHostTarget::new(original.clone())));
    if let Some(hooks) = hooks {
        session = session.with_hooks(hooks);
    }
    if let Some(relocator) = relocator {
        session = session.with_relocator(relocator);
    }
    let session = manager.register(window_id(hwnd), session)?;

    let wrapped: IDropTarget = WrappedDropTarget::new(session).into();
    unsafe {
        let _ = RevokeDragDrop(hwnd);
        if let Err(e) = RegisterDragDrop(hwnd, &wrapped) {
            log::error!("[Windows] RegisterDragDrop failed on {:?}: {}", hwnd, e);
            let _ = RegisterDragDrop(hwnd, &original);
            manager.unregister(window_id(hwnd));
            return Err(host_error("RegisterDragDrop", e));
        }
    }
    log::info!("[Windows] intercepting drops on {:?}", hwnd);
    Ok(Interception { hwnd, original })
}

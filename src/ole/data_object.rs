//! `IDataObject` in both directions

use std::any::Any;
use std::io::{self, Read, Seek, SeekFrom};

use windows::core::{implement, HRESULT};
use windows::Win32::Foundation::{
    DATA_S_SAMEFORMATETC, DV_E_FORMATETC, DV_E_TYMED, E_INVALIDARG, E_NOTIMPL, E_OUTOFMEMORY,
    OLE_E_ADVISENOTSUPPORTED, S_OK,
};
use windows::Win32::System::Com::{
    IAdviseSink, IDataObject, IDataObject_Impl, IEnumFORMATETC, IEnumSTATDATA, IStream,
    DVASPECT_CONTENT, FORMATETC, STGMEDIUM, STREAM_SEEK, STREAM_SEEK_CUR, STREAM_SEEK_END,
    STREAM_SEEK_SET, TYMED_FILE, TYMED_HGLOBAL, TYMED_ISTREAM,
};
use windows::Win32::System::Memory::{GlobalAlloc, GlobalLock, GlobalSize, GlobalUnlock, GMEM_MOVEABLE};
use windows::Win32::System::Ole::ReleaseStgMedium;
use windows_core::{BOOL, Ref};

use super::{format_for_id, format_id, KNOWN_FORMATS};
use crate::carrier::{Carrier, ClipFormat, DataCarrier};
use crate::transfer::TransferSource;

// ============================================================================
// Drag source side
// ============================================================================

/// The drag source's `IDataObject` as a carrier
pub struct OleCarrier {
    data: IDataObject,
}

// The drag protocol only ever touches the carrier from the window's thread
unsafe impl Send for OleCarrier {}
unsafe impl Sync for OleCarrier {}

impl OleCarrier {
    pub fn new(data: IDataObject) -> Self {
        Self { data }
    }

    pub fn data_object(&self) -> &IDataObject {
        &self.data
    }

    fn format_etc(format: &ClipFormat, index: Option<u32>) -> FORMATETC {
        FORMATETC {
            cfFormat: format_id(format),
            ptd: std::ptr::null_mut(),
            dwAspect: DVASPECT_CONTENT.0 as u32,
            lindex: index.map_or(-1, |i| i as i32),
            tymed: (TYMED_HGLOBAL.0 | TYMED_FILE.0 | TYMED_ISTREAM.0) as u32,
        }
    }
}

impl DataCarrier for OleCarrier {
    fn formats(&self) -> Vec<ClipFormat> {
        KNOWN_FORMATS
            .into_iter()
            .filter(|f| {
                let etc = Self::format_etc(f, None);
                // SAFETY: etc outlives the call
                unsafe { self.data.QueryGetData(&etc) == S_OK }
            })
            .collect()
    }

    fn get(&self, format: &ClipFormat, index: Option<u32>) -> Option<TransferSource> {
        let etc = Self::format_etc(format, index);
        // SAFETY: the medium is released exactly once below, after its
        // contents have been copied or its stream cloned
        unsafe {
            let mut medium = self.data.GetData(&etc).ok()?;
            let source = medium_to_source(&medium);
            ReleaseStgMedium(&mut medium);
            source
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

unsafe fn medium_to_source(medium: &STGMEDIUM) -> Option<TransferSource> {
    match medium.tymed {
        t if t == TYMED_HGLOBAL.0 as u32 => {
            let hglobal = medium.u.hGlobal;
            if hglobal.0.is_null() {
                return None;
            }
            let ptr = GlobalLock(hglobal);
            if ptr.is_null() {
                return None;
            }
            let size = GlobalSize(hglobal);
            let bytes = std::slice::from_raw_parts(ptr as *const u8, size).to_vec();
            let _ = GlobalUnlock(hglobal);
            Some(TransferSource::Memory(bytes))
        }
        t if t == TYMED_FILE.0 as u32 => {
            // Releasing a medium the source handed over deletes the file
            let name = medium.u.lpszFileName.to_string().ok()?;
            match std::fs::read(&name) {
                Ok(bytes) => Some(TransferSource::Memory(bytes)),
                Err(e) => {
                    log::debug!("[Windows] could not read medium file {}: {}", name, e);
                    None
                }
            }
        }
        t if t == TYMED_ISTREAM.0 as u32 => {
            let stream = (*medium.u.pstm).clone()?;
            TransferSource::from_stream(Box::new(ComStream(stream))).ok()
        }
        other => {
            log::debug!("[Windows] unsupported medium {}", other);
            None
        }
    }
}

/// `IStream` as `Read + Seek`
struct ComStream(IStream);

// Only read from the thread that received the drag event
unsafe impl Send for ComStream {}

impl Read for ComStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let len = u32::try_from(buf.len()).unwrap_or(u32::MAX);
        let mut read = 0u32;
        // SAFETY: buf is valid for `len` bytes of writes
        let hr = unsafe { self.0.Read(buf.as_mut_ptr().cast(), len, Some(&mut read)) };
        hr.ok().map_err(io::Error::other)?;
        Ok(read as usize)
    }
}

impl Seek for ComStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let (offset, origin): (i64, STREAM_SEEK) = match pos {
            SeekFrom::Start(n) => (n as i64, STREAM_SEEK_SET),
            SeekFrom::Current(n) => (n, STREAM_SEEK_CUR),
            SeekFrom::End(n) => (n, STREAM_SEEK_END),
        };
        let mut position = 0u64;
        // SAFETY: position is a valid out pointer for the call
        unsafe { self.0.Seek(offset, origin, Some(&mut position)) }.map_err(io::Error::other)?;
        Ok(position)
    }
}

// ============================================================================
// Host side
// ============================================================================

/// Any carrier served to the host as an `IDataObject`. Every format is
/// handed out as a fresh `HGLOBAL`.
#[implement(IDataObject)]
pub struct CarrierDataObject {
    carrier: Carrier,
}

impl CarrierDataObject {
    pub fn new(carrier: Carrier) -> Self {
        Self { carrier }
    }

    /// The data object the host should see for `carrier`: a foreign one is
    /// passed through as is, anything else gets wrapped.
    pub fn for_carrier(carrier: &Carrier) -> IDataObject {
        match carrier.as_any().downcast_ref::<OleCarrier>() {
            Some(ole) => ole.data_object().clone(),
            None => CarrierDataObject::new(carrier.clone()).into(),
        }
    }

    fn lookup(&self, pformatetc: *const FORMATETC) -> Result<(ClipFormat, Option<u32>), HRESULT> {
        if pformatetc.is_null() {
            return Err(E_INVALIDARG);
        }
        // SAFETY: checked for null; OLE guarantees it points at a FORMATETC
        let etc = unsafe { &*pformatetc };
        if etc.tymed & TYMED_HGLOBAL.0 as u32 == 0 {
            return Err(DV_E_TYMED);
        }
        let format = format_for_id(etc.cfFormat)
            .filter(|f| self.carrier.has_format(f))
            .ok_or(DV_E_FORMATETC)?;
        let index = u32::try_from(etc.lindex).ok();
        Ok((format, index))
    }
}

impl IDataObject_Impl for CarrierDataObject_Impl {
    fn GetData(&self, pformatetc: *const FORMATETC) -> windows_core::Result<STGMEDIUM> {
        let (format, index) = self.lookup(pformatetc).map_err(windows_core::Error::from_hresult)?;
        let mut source = self
            .carrier
            .get(&format, index)
            .ok_or_else(|| windows_core::Error::from_hresult(DV_E_FORMATETC))?;
        let bytes = source
            .read_all()
            .map_err(|_| windows_core::Error::from_hresult(E_OUTOFMEMORY))?;

        unsafe {
            let hglobal = GlobalAlloc(GMEM_MOVEABLE, bytes.len().max(1))
                .map_err(|_| windows_core::Error::from_hresult(E_OUTOFMEMORY))?;
            let ptr = GlobalLock(hglobal);
            if ptr.is_null() {
                return Err(windows_core::Error::from_hresult(E_OUTOFMEMORY));
            }
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr as *mut u8, bytes.len());
            let _ = GlobalUnlock(hglobal);

            let mut medium = STGMEDIUM::default();
            medium.tymed = TYMED_HGLOBAL.0 as u32;
            medium.u.hGlobal = hglobal;
            medium.pUnkForRelease = std::mem::ManuallyDrop::new(None);
            Ok(medium)
        }
    }

    fn GetDataHere(&self, _pformatetc: *const FORMATETC, _pmedium: *mut STGMEDIUM) -> windows_core::Result<()> {
        Err(windows_core::Error::from_hresult(E_NOTIMPL))
    }

    fn QueryGetData(&self, pformatetc: *const FORMATETC) -> HRESULT {
        match self.lookup(pformatetc) {
            Ok(_) => S_OK,
            Err(hr) => hr,
        }
    }

    fn GetCanonicalFormatEtc(&self, _pformatectin: *const FORMATETC, pformatetcout: *mut FORMATETC) -> HRESULT {
        unsafe {
            if !pformatetcout.is_null() {
                (*pformatetcout).ptd = std::ptr::null_mut();
            }
        }
        DATA_S_SAMEFORMATETC
    }

    fn SetData(&self, _pformatetc: *const FORMATETC, _pmedium: *const STGMEDIUM, _frelease: BOOL) -> windows_core::Result<()> {
        Err(windows_core::Error::from_hresult(E_NOTIMPL))
    }

    fn EnumFormatEtc(&self, _dwdirection: u32) -> windows_core::Result<IEnumFORMATETC> {
        Err(windows_core::Error::from_hresult(E_NOTIMPL))
    }

    fn DAdvise(&self, _pformatetc: *const FORMATETC, _advf: u32, _padvsink: Ref<'_, IAdviseSink>) -> windows_core::Result<u32> {
        Err(windows_core::Error::from_hresult(OLE_E_ADVISENOTSUPPORTED))
    }

    fn DUnadvise(&self, _dwconnection: u32) -> windows_core::Result<()> {
        Err(windows_core::Error::from_hresult(OLE_E_ADVISENOTSUPPORTED))
    }

    fn EnumDAdvise(&self) -> windows_core::Result<IEnumSTATDATA> {
        Err(windows_core::Error::from_hresult(OLE_E_ADVISENOTSUPPORTED))
    }
}

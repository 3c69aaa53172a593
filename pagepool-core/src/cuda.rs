//! CUDA-backed devices, enabled with the `cuda` feature.

use std::{ffi::c_void, fmt, ops::Range, sync::Arc};

use cudarc::driver::{CudaContext, result as cuda_driver, sys};
use log::{error, info};

use crate::config::DType;
use crate::device::{Device, DeviceBuffer, DeviceError, DeviceId, check_bounds};

fn check(result: sys::CUresult, op: &str) -> Result<(), DeviceError> {
    if result != sys::cudaError_enum::CUDA_SUCCESS {
        return Err(DeviceError::Fault(format!("{op} failed: {result:?}")));
    }
    Ok(())
}

/// One CUDA GPU, addressed by ordinal.
pub struct CudaDevice {
    id: DeviceId,
    name: String,
    ctx: Arc<CudaContext>,
    total_bytes: u64,
}

impl CudaDevice {
    pub fn new(ordinal: u32) -> Result<Self, DeviceError> {
        let ctx = CudaContext::new(ordinal as usize)
            .map_err(|e| DeviceError::Fault(format!("failed to create CUDA context: {e:?}")))?;
        ctx.bind_to_thread()
            .map_err(|e| DeviceError::Fault(format!("failed to bind CUDA context: {e:?}")))?;
        let (_, total_bytes) = cuda_driver::mem_get_info()
            .map_err(|e| DeviceError::Fault(format!("cuMemGetInfo failed: {e:?}")))?;
        let name = ctx.name().unwrap_or_else(|_| format!("cuda:{ordinal}"));

        info!("CUDA device opened: ordinal={} name={} total_bytes={}", ordinal, name, total_bytes);

        Ok(Self {
            id: DeviceId(ordinal),
            name,
            ctx,
            total_bytes: total_bytes as u64,
        })
    }

    fn bind(&self) -> Result<(), DeviceError> {
        self.ctx
            .bind_to_thread()
            .map_err(|e| DeviceError::Fault(format!("failed to bind CUDA context: {e:?}")))
    }
}

impl fmt::Debug for CudaDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CudaDevice")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("total_bytes", &self.total_bytes)
            .finish()
    }
}

impl Device for CudaDevice {
    fn id(&self) -> DeviceId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn max_buffer_bytes(&self) -> u64 {
        self.total_bytes
    }

    fn allocate(&self, dtype: DType, elements: usize) -> Result<Box<dyn DeviceBuffer>, DeviceError> {
        let len = elements
            .checked_mul(dtype.size_bytes())
            .ok_or(DeviceError::OutOfMemory { requested: u64::MAX })?;
        self.bind()?;

        let mut ptr: sys::CUdeviceptr = 0;
        let result = unsafe { sys::cuMemAlloc_v2(&mut ptr, len) };
        if result == sys::cudaError_enum::CUDA_ERROR_OUT_OF_MEMORY {
            return Err(DeviceError::OutOfMemory { requested: len as u64 });
        }
        check(result, "cuMemAlloc_v2")?;

        let buffer = CudaBuffer {
            ctx: Arc::clone(&self.ctx),
            device: self.id,
            ptr,
            len,
        };
        // Fresh pages read as zero, like host buffers.
        check(unsafe { sys::cuMemsetD8_v2(ptr, 0, len) }, "cuMemsetD8_v2")?;
        Ok(Box::new(buffer))
    }
}

/// A `cuMemAlloc` region, freed on drop.
pub struct CudaBuffer {
    ctx: Arc<CudaContext>,
    device: DeviceId,
    ptr: sys::CUdeviceptr,
    len: usize,
}

impl CudaBuffer {
    fn bind(&self) -> Result<(), DeviceError> {
        self.ctx
            .bind_to_thread()
            .map_err(|e| DeviceError::Fault(format!("failed to bind CUDA context: {e:?}")))
    }
}

impl fmt::Debug for CudaBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CudaBuffer")
            .field("device", &self.device)
            .field("ptr", &format_args!("{:#x}", self.ptr))
            .field("len", &self.len)
            .finish()
    }
}

impl DeviceBuffer for CudaBuffer {
    fn len_bytes(&self) -> usize {
        self.len
    }

    fn copy_within(&mut self, src: Range<usize>, dst: usize) -> Result<(), DeviceError> {
        check_bounds(src.start, src.len(), self.len)?;
        check_bounds(dst, src.len(), self.len)?;
        self.bind()?;
        let result = unsafe {
            sys::cuMemcpyDtoD_v2(self.ptr + dst as u64, self.ptr + src.start as u64, src.len())
        };
        check(result, "cuMemcpyDtoD_v2")
    }

    fn read(&self, offset: usize, out: &mut [u8]) -> Result<(), DeviceError> {
        check_bounds(offset, out.len(), self.len)?;
        self.bind()?;
        let result = unsafe {
            sys::cuMemcpyDtoH_v2(out.as_mut_ptr() as *mut c_void, self.ptr + offset as u64, out.len())
        };
        check(result, "cuMemcpyDtoH_v2")
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), DeviceError> {
        check_bounds(offset, data.len(), self.len)?;
        self.bind()?;
        let result = unsafe {
            sys::cuMemcpyHtoD_v2(self.ptr + offset as u64, data.as_ptr() as *const c_void, data.len())
        };
        check(result, "cuMemcpyHtoD_v2")
    }
}

impl Drop for CudaBuffer {
    fn drop(&mut self) {
        if self.bind().is_err() {
            error!("Leaking CUDA buffer: device={} len={}", self.device, self.len);
            return;
        }
        let result = unsafe { sys::cuMemFree_v2(self.ptr) };
        if result != sys::cudaError_enum::CUDA_SUCCESS {
            error!("cuMemFree_v2 failed: device={} error={:?}", self.device, result);
        }
    }
}

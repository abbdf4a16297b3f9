//! Virtual-memory management for JIT code: RWX mappings, dual RX/RW
//! mappings backed by anonymous shared memory, protection toggling and
//! instruction-cache maintenance.
//!
//! Everything in this module is process-global; the allocator built on top
//! of it treats these functions as its only window to the operating system.

use core::ops::{BitOr, BitOrAssign};

use crate::Error;

/// Virtual memory information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Info {
    /// The size of a page of virtual memory.
    pub page_size: u32,
    /// The allocation granularity of virtual memory.
    pub page_granularity: u32,
}

/// Memory access and mapping flags accepted by [alloc] and
/// [alloc_dual_mapping].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct MemoryFlags(pub u32);

impl MemoryFlags {
    /// No flags.
    pub const NONE: u32 = 0;
    /// Memory is readable.
    pub const ACCESS_READ: u32 = 0x0000_0001;
    /// Memory is writable.
    pub const ACCESS_WRITE: u32 = 0x0000_0002;
    /// Memory is executable.
    pub const ACCESS_EXECUTE: u32 = 0x0000_0004;

    /// Memory is readable and writable.
    pub const ACCESS_RW: u32 = Self::ACCESS_READ | Self::ACCESS_WRITE;
    /// Memory is readable and executable.
    pub const ACCESS_RX: u32 = Self::ACCESS_READ | Self::ACCESS_EXECUTE;
    /// Memory is readable, writable and executable.
    pub const ACCESS_RWX: u32 = Self::ACCESS_READ | Self::ACCESS_WRITE | Self::ACCESS_EXECUTE;

    /// Use `MAP_JIT` (Apple platforms), which allows RWX mappings in a
    /// hardened process. Turned on automatically when required.
    pub const MMAP_ENABLE_JIT: u32 = 0x0000_0010;

    /// Cap the maximum access of the mapping at "read" on platforms that
    /// support `PROT_MAX` / `PROT_MPROTECT`.
    pub const MMAP_MAX_ACCESS_READ: u32 = 0x0000_0020;
    /// Cap the maximum access of the mapping at "write".
    pub const MMAP_MAX_ACCESS_WRITE: u32 = 0x0000_0040;
    /// Cap the maximum access of the mapping at "execute".
    pub const MMAP_MAX_ACCESS_EXECUTE: u32 = 0x0000_0080;

    /// Use `MAP_SHARED` when calling mmap(). Dual mappings force this so
    /// the OS cannot apply copy-on-write to the RW view.
    pub const MAP_SHARED: u32 = 0x0000_0100;

    /// Only used by [alloc_dual_mapping]: prefer a temporary directory over
    /// "/dev/shm" for the backing file on POSIX platforms.
    pub const MAPPING_PREFER_TMP: u32 = 0x8000_0000;

    pub fn contains(self, other: u32) -> bool {
        (self.0 & other) != 0
    }
}

impl From<u32> for MemoryFlags {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<MemoryFlags> for u32 {
    fn from(value: MemoryFlags) -> Self {
        value.0
    }
}

impl BitOr for MemoryFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOr<u32> for MemoryFlags {
    type Output = Self;

    fn bitor(self, rhs: u32) -> Self {
        Self(self.0 | rhs)
    }
}

impl BitOrAssign for MemoryFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitOrAssign<u32> for MemoryFlags {
    fn bitor_assign(&mut self, rhs: u32) {
        self.0 |= rhs;
    }
}

/// Anonymous memory mapped into two views of the same physical pages: one
/// read+execute and one read+write. When the mapping is not dual, both
/// pointers are equal.
#[derive(Debug)]
pub struct DualMapping {
    /// The read+execute view (not writable when dual-mapped).
    pub rx: *const u8,
    /// The read+write view (not executable when dual-mapped).
    pub rw: *mut u8,
}

/// What the current process is allowed to do with RWX memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HardenedRuntimeInfo {
    /// W^X is enforced: memory cannot be mapped writable and executable at
    /// the same time (without `MAP_JIT`).
    pub enabled: bool,
    /// RWX mappings are possible through Apple's `MAP_JIT` together with
    /// per-thread write protection.
    pub map_jit: bool,
}

/// Access kind for [protect_jit_memory].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum ProtectJitAccess {
    /// Protect JIT memory with read+write permissions.
    ReadWrite = 0,
    /// Protect JIT memory with read+execute permissions.
    ReadExecute = 1,
}

/// Access bits stripped from the RX view (index 0) and the RW view
/// (index 1) of a dual mapping.
const DUAL_MAPPING_FILTER: [u32; 2] = [
    MemoryFlags::ACCESS_WRITE | MemoryFlags::MMAP_MAX_ACCESS_WRITE,
    MemoryFlags::ACCESS_EXECUTE | MemoryFlags::MMAP_MAX_ACCESS_EXECUTE,
];

cfgenius::define! {
    vm_shm_detect = cfg(any(target_vendor = "apple", target_os = "android"));
    has_shm_open = cfg(not(target_os = "android"));
    has_shm_anon = cfg(target_os = "freebsd");
}

/// Returns cached virtual memory information.
pub fn info() -> Info {
    static INFO: once_cell::sync::Lazy<Info> = once_cell::sync::Lazy::new(get_vm_info);
    *INFO
}

/// Returns information about the hardened runtime of the current process.
pub fn hardened_runtime_info() -> HardenedRuntimeInfo {
    HardenedRuntimeInfo {
        enabled: has_hardened_runtime(),
        map_jit: has_map_jit_support(),
    }
}

cfgenius::cond! {
    if cfg(not(windows)) {
        use core::mem::MaybeUninit;
        use core::sync::atomic::{AtomicU32, Ordering};
        use std::ffi::CString;

        use errno::errno;

        fn error_from_errno() -> Error {
            match errno().0 {
                libc::EACCES | libc::EAGAIN | libc::ENODEV | libc::EPERM => Error::InvalidState,
                libc::EFBIG | libc::ENOMEM | libc::EOVERFLOW => Error::OutOfMemory,
                libc::EMFILE | libc::ENFILE => Error::TooManyHandles,
                _ => Error::InvalidArgument,
            }
        }

        /// Milliseconds from the monotonic clock, truncated. Only used to
        /// salt generated shared-memory names.
        #[cfg(not(target_os = "freebsd"))]
        fn tick_count() -> u32 {
            let mut ts = MaybeUninit::<libc::timespec>::zeroed();

            unsafe {
                if libc::clock_gettime(libc::CLOCK_MONOTONIC, ts.as_mut_ptr()) != 0 {
                    return 0;
                }
                let ts = ts.assume_init();
                ((ts.tv_sec as u64).wrapping_mul(1000) + ts.tv_nsec as u64 / 1_000_000) as u32
            }
        }

        fn get_vm_info() -> Info {
            extern "C" {
                fn getpagesize() -> libc::c_int;
            }

            let page_size = unsafe { getpagesize() } as u32;

            Info {
                page_size,
                page_granularity: page_size.max(65536),
            }
        }

        fn mm_prot_from_memory_flags(memory_flags: MemoryFlags) -> libc::c_int {
            let mut prot = 0;

            if memory_flags.contains(MemoryFlags::ACCESS_READ) {
                prot |= libc::PROT_READ;
            }
            if memory_flags.contains(MemoryFlags::ACCESS_WRITE) {
                prot |= libc::PROT_WRITE;
            }
            if memory_flags.contains(MemoryFlags::ACCESS_EXECUTE) {
                prot |= libc::PROT_EXEC;
            }

            prot
        }

        // Some operating systems don't allow /dev/shm to be executable; on
        // Linux this happens when /dev/shm is mounted with 'noexec', and
        // Apple platforms restrict it likewise. The strategy is detected at
        // runtime where the restriction can apply.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(u8)]
        enum AnonymousMemoryStrategy {
            DevShm = 1,
            TmpDir = 2,
        }

        #[cfg(not(target_os = "freebsd"))]
        fn get_tmp_dir() -> String {
            std::env::var("TMPDIR").unwrap_or_else(|_| String::from("/tmp"))
        }

        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        enum FileType {
            None,
            Shm,
            Tmp,
        }

        /// An open file descriptor backing an anonymous shared-memory
        /// object, unlinked and closed on drop.
        struct AnonymousMemory {
            fd: libc::c_int,
            file_type: FileType,
            name: CString,
        }

        impl AnonymousMemory {
            fn new() -> Self {
                Self {
                    fd: -1,
                    file_type: FileType::None,
                    name: CString::default(),
                }
            }

            #[allow(unused_variables, unreachable_code)]
            fn open(&mut self, prefer_tmp_over_dev_shm: bool) -> Result<(), Error> {
                cfgenius::cond! {
                    if cfg(target_os = "linux") {
                        // Linux specific 'memfd_create' - if the syscall
                        // returns ENOSYS it's not available and we will never
                        // call it again.
                        use core::sync::atomic::AtomicBool;
                        static MEMFD_CREATE_NOT_SUPPORTED: AtomicBool = AtomicBool::new(false);

                        if !MEMFD_CREATE_NOT_SUPPORTED.load(Ordering::Relaxed) {
                            unsafe {
                                self.fd = libc::syscall(
                                    libc::SYS_memfd_create,
                                    b"jitpool\0".as_ptr(),
                                    libc::MFD_CLOEXEC,
                                ) as libc::c_int;

                                if self.fd >= 0 {
                                    return Ok(());
                                }

                                if errno().0 == libc::ENOSYS {
                                    MEMFD_CREATE_NOT_SUPPORTED.store(true, Ordering::Relaxed);
                                } else {
                                    return Err(error_from_errno());
                                }
                            }
                        }
                    }
                }

                cfgenius::cond! {
                    if all(macro(has_shm_open), macro(has_shm_anon)) {
                        unsafe {
                            self.fd = libc::shm_open(
                                libc::SHM_ANON,
                                libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                                libc::S_IRUSR | libc::S_IWUSR,
                            );

                            if self.fd >= 0 {
                                return Ok(());
                            }
                            return Err(error_from_errno());
                        }
                    } else {
                        // POSIX fallback. The generated name is nothing
                        // cryptographic, it just has to avoid collisions
                        // between threads and retries; O_EXCL guarantees we
                        // never open an existing object.
                        static INTERNAL_COUNTER: AtomicU32 = AtomicU32::new(0);

                        let mut bits = (self as *const Self as u64) & 0x5555_5555;

                        for _ in 0..100 {
                            bits = bits.wrapping_sub((tick_count() as u64).wrapping_mul(773_703_683));
                            bits = ((bits >> 14) ^ (bits << 6))
                                .wrapping_add(INTERNAL_COUNTER.fetch_add(1, Ordering::AcqRel) as u64)
                                .wrapping_add(10_619_863);

                            let use_tmp;
                            cfgenius::cond! {
                                if macro(vm_shm_detect) {
                                    use_tmp = true;
                                } else {
                                    use_tmp = prefer_tmp_over_dev_shm;
                                }
                            };

                            if use_tmp {
                                let path = format!("{}/shm-id-{:016X}", get_tmp_dir(), bits);
                                let name = CString::new(path).map_err(|_| Error::InvalidArgument)?;

                                unsafe {
                                    self.fd = libc::open(
                                        name.as_ptr(),
                                        libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                                        libc::S_IRUSR | libc::S_IWUSR,
                                    );
                                }

                                if self.fd >= 0 {
                                    self.file_type = FileType::Tmp;
                                    self.name = name;
                                    return Ok(());
                                }
                            } else {
                                let name = CString::new(format!("/shm-id-{:016X}", bits))
                                    .map_err(|_| Error::InvalidArgument)?;

                                unsafe {
                                    self.fd = libc::shm_open(
                                        name.as_ptr(),
                                        libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                                        libc::S_IRUSR | libc::S_IWUSR,
                                    );
                                }

                                if self.fd >= 0 {
                                    self.file_type = FileType::Shm;
                                    self.name = name;
                                    return Ok(());
                                }
                            }

                            if errno().0 != libc::EEXIST {
                                return Err(error_from_errno());
                            }
                        }
                    }
                }

                Err(Error::FailedToOpenAnonymousMemory)
            }

            fn unlink(&mut self) {
                let file_type = self.file_type;
                self.file_type = FileType::None;

                cfgenius::cond! {
                    if macro(has_shm_open) {
                        if file_type == FileType::Shm {
                            unsafe {
                                libc::shm_unlink(self.name.as_ptr());
                            }
                            return;
                        }
                    }
                }

                #[allow(unreachable_code)]
                if file_type == FileType::Tmp {
                    unsafe {
                        libc::unlink(self.name.as_ptr());
                    }
                }
            }

            fn close(&mut self) {
                if self.fd >= 0 {
                    unsafe {
                        libc::close(self.fd);
                    }
                    self.fd = -1;
                }
            }

            fn allocate(&self, size: usize) -> Result<(), Error> {
                unsafe {
                    if libc::ftruncate(self.fd, size as libc::off_t) != 0 {
                        return Err(error_from_errno());
                    }
                }
                Ok(())
            }
        }

        impl Drop for AnonymousMemory {
            fn drop(&mut self) {
                self.unlink();
                self.close();
            }
        }

        cfgenius::cond! {
            if macro(vm_shm_detect) {
                fn detect_anonymous_memory_strategy() -> Result<AnonymousMemoryStrategy, Error> {
                    let mut anon_mem = AnonymousMemory::new();
                    let vm_info = info();

                    anon_mem.open(false)?;
                    anon_mem.allocate(vm_info.page_size as usize)?;

                    unsafe {
                        let ptr = libc::mmap(
                            core::ptr::null_mut(),
                            vm_info.page_size as libc::size_t,
                            libc::PROT_READ | libc::PROT_EXEC,
                            libc::MAP_SHARED,
                            anon_mem.fd,
                            0,
                        );

                        if ptr == libc::MAP_FAILED {
                            if errno().0 == libc::EINVAL {
                                return Ok(AnonymousMemoryStrategy::TmpDir);
                            }
                            Err(error_from_errno())
                        } else {
                            libc::munmap(ptr, vm_info.page_size as libc::size_t);
                            Ok(AnonymousMemoryStrategy::DevShm)
                        }
                    }
                }
            }
        }

        #[allow(unreachable_code)]
        fn get_anonymous_memory_strategy() -> Result<AnonymousMemoryStrategy, Error> {
            cfgenius::cond! {
                if macro(vm_shm_detect) {
                    use core::sync::atomic::AtomicU8;
                    static GLOBAL_STRATEGY: AtomicU8 = AtomicU8::new(0);

                    match GLOBAL_STRATEGY.load(Ordering::Acquire) {
                        1 => return Ok(AnonymousMemoryStrategy::DevShm),
                        2 => return Ok(AnonymousMemoryStrategy::TmpDir),
                        _ => {}
                    }

                    let strategy = detect_anonymous_memory_strategy()?;
                    GLOBAL_STRATEGY.store(strategy as u8, Ordering::Release);
                    return Ok(strategy);
                }
            }

            Ok(AnonymousMemoryStrategy::TmpDir)
        }

        fn has_hardened_runtime() -> bool {
            cfgenius::cond! {
                if cfg(target_os = "macos") {
                    // macOS enforces W^X for hardened processes and the
                    // probe below is not reliable there.
                    true
                } else {
                    static GLOBAL_HARDENED_FLAG: AtomicU32 = AtomicU32::new(0);

                    let mut flag = GLOBAL_HARDENED_FLAG.load(Ordering::Acquire);

                    if flag == 0 {
                        let page_size = info().page_size as libc::size_t;

                        unsafe {
                            let ptr = libc::mmap(
                                core::ptr::null_mut(),
                                page_size,
                                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                                -1,
                                0,
                            );

                            if ptr == libc::MAP_FAILED {
                                flag = 2;
                            } else {
                                flag = 1;
                                libc::munmap(ptr, page_size);
                            }
                        }

                        GLOBAL_HARDENED_FLAG.store(flag, Ordering::Release);
                    }

                    flag == 2
                }
            }
        }

        fn has_map_jit_support() -> bool {
            cfg!(target_os = "macos")
        }

        fn map_jit_from_memory_flags(memory_flags: MemoryFlags) -> libc::c_int {
            cfgenius::cond! {
                if cfg(target_vendor = "apple") {
                    // MAP_JIT is not required when dual-mapping and is
                    // incompatible with MAP_SHARED.
                    let use_map_jit = (memory_flags.contains(MemoryFlags::MMAP_ENABLE_JIT)
                        || has_hardened_runtime())
                        && !memory_flags.contains(MemoryFlags::MAP_SHARED);

                    if use_map_jit && has_map_jit_support() {
                        libc::MAP_JIT
                    } else {
                        0
                    }
                } else {
                    let _ = memory_flags;
                    0
                }
            }
        }

        fn map_memory(
            size: usize,
            memory_flags: MemoryFlags,
            fd: libc::c_int,
            offset: libc::off_t,
        ) -> Result<*mut u8, Error> {
            if size == 0 {
                return Err(Error::InvalidArgument);
            }

            let protection = mm_prot_from_memory_flags(memory_flags);

            let mut mm_flags = map_jit_from_memory_flags(memory_flags);
            mm_flags |= if memory_flags.contains(MemoryFlags::MAP_SHARED) {
                libc::MAP_SHARED
            } else {
                libc::MAP_PRIVATE
            };

            if fd == -1 {
                mm_flags |= libc::MAP_ANONYMOUS;
            }

            unsafe {
                let ptr = libc::mmap(
                    core::ptr::null_mut(),
                    size as libc::size_t,
                    protection,
                    mm_flags,
                    fd,
                    offset,
                );

                if ptr == libc::MAP_FAILED {
                    return Err(error_from_errno());
                }
                Ok(ptr.cast())
            }
        }

        fn unmap_memory(ptr: *mut u8, size: usize) -> Result<(), Error> {
            if size == 0 {
                return Err(Error::InvalidArgument);
            }

            unsafe {
                if libc::munmap(ptr.cast(), size as libc::size_t) == 0 {
                    Ok(())
                } else {
                    Err(error_from_errno())
                }
            }
        }

        /// Allocates virtual memory with the given access `memory_flags`.
        pub fn alloc(size: usize, memory_flags: MemoryFlags) -> Result<*mut u8, Error> {
            map_memory(size, memory_flags, -1, 0)
        }

        /// Releases virtual memory previously allocated by [alloc].
        pub fn release(ptr: *mut u8, size: usize) -> Result<(), Error> {
            unmap_memory(ptr, size)
        }

        /// Changes the protection of an existing mapped region.
        pub fn protect(ptr: *mut u8, size: usize, memory_flags: MemoryFlags) -> Result<(), Error> {
            let protection = mm_prot_from_memory_flags(memory_flags);

            unsafe {
                if libc::mprotect(ptr.cast(), size as libc::size_t, protection) == 0 {
                    Ok(())
                } else {
                    Err(error_from_errno())
                }
            }
        }

        /// Allocates anonymous shared memory and maps it into two views: an
        /// RX view without write access and an RW view without execute
        /// access. The result must be released with [release_dual_mapping],
        /// never with [release].
        pub fn alloc_dual_mapping(
            size: usize,
            memory_flags: MemoryFlags,
        ) -> Result<DualMapping, Error> {
            if size == 0 || size as isize <= 0 {
                return Err(Error::InvalidArgument);
            }

            let mut prefer_tmp = memory_flags.contains(MemoryFlags::MAPPING_PREFER_TMP);
            if !prefer_tmp {
                prefer_tmp = get_anonymous_memory_strategy()? == AnonymousMemoryStrategy::TmpDir;
            }

            let mut anon_mem = AnonymousMemory::new();
            anon_mem.open(prefer_tmp)?;
            anon_mem.allocate(size)?;

            let mut ptr = [core::ptr::null_mut(), core::ptr::null_mut()];
            for i in 0..2 {
                let view_flags =
                    MemoryFlags((memory_flags.0 & !DUAL_MAPPING_FILTER[i]) | MemoryFlags::MAP_SHARED);

                ptr[i] = match map_memory(size, view_flags, anon_mem.fd, 0) {
                    Ok(p) => p,
                    Err(e) => {
                        if i == 1 {
                            let _ = unmap_memory(ptr[0], size);
                        }
                        return Err(e);
                    }
                };
            }

            Ok(DualMapping {
                rx: ptr[0],
                rw: ptr[1],
            })
        }

        /// Releases a dual mapping previously allocated by
        /// [alloc_dual_mapping]. Both pointers are set to null on success.
        pub fn release_dual_mapping(dm: &mut DualMapping, size: usize) -> Result<(), Error> {
            let err1 = unmap_memory(dm.rx as *mut u8, size);
            let err2 = if dm.rx != dm.rw as *const u8 {
                unmap_memory(dm.rw, size)
            } else {
                Ok(())
            };

            err1?;
            err2?;

            dm.rx = core::ptr::null();
            dm.rw = core::ptr::null_mut();
            Ok(())
        }
    }
}

cfgenius::cond! {
    if cfg(windows) {
        use core::mem::MaybeUninit;

        use winapi::shared::basetsd::SIZE_T;
        use winapi::shared::minwindef::DWORD;
        use winapi::shared::ntdef::HANDLE;
        use winapi::um::handleapi::{CloseHandle, INVALID_HANDLE_VALUE};
        use winapi::um::memoryapi::{
            CreateFileMappingW, MapViewOfFile, UnmapViewOfFile, VirtualAlloc, VirtualFree,
            VirtualProtect, FILE_MAP_EXECUTE, FILE_MAP_READ, FILE_MAP_WRITE,
        };
        use winapi::um::sysinfoapi::{GetSystemInfo, SYSTEM_INFO};
        use winapi::um::winnt::{
            MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE,
            PAGE_READONLY, PAGE_READWRITE,
        };

        struct ScopedHandle {
            value: HANDLE,
        }

        impl ScopedHandle {
            fn new() -> Self {
                Self {
                    value: core::ptr::null_mut(),
                }
            }
        }

        impl Drop for ScopedHandle {
            fn drop(&mut self) {
                if !self.value.is_null() {
                    unsafe {
                        CloseHandle(self.value);
                    }
                }
            }
        }

        fn get_vm_info() -> Info {
            let mut system_info = MaybeUninit::<SYSTEM_INFO>::uninit();

            unsafe {
                GetSystemInfo(system_info.as_mut_ptr());
                let system_info = system_info.assume_init();

                Info {
                    page_size: system_info.dwPageSize,
                    page_granularity: system_info.dwAllocationGranularity,
                }
            }
        }

        fn protect_flags_from_memory_flags(memory_flags: MemoryFlags) -> DWORD {
            if memory_flags.contains(MemoryFlags::ACCESS_EXECUTE) {
                if memory_flags.contains(MemoryFlags::ACCESS_WRITE) {
                    PAGE_EXECUTE_READWRITE
                } else {
                    PAGE_EXECUTE_READ
                }
            } else if memory_flags.contains(MemoryFlags::ACCESS_WRITE) {
                PAGE_READWRITE
            } else {
                PAGE_READONLY
            }
        }

        fn desired_access_from_memory_flags(memory_flags: MemoryFlags) -> DWORD {
            let mut access = if memory_flags.contains(MemoryFlags::ACCESS_WRITE) {
                FILE_MAP_WRITE
            } else {
                FILE_MAP_READ
            };

            if memory_flags.contains(MemoryFlags::ACCESS_EXECUTE) {
                access |= FILE_MAP_EXECUTE;
            }

            access
        }

        fn has_hardened_runtime() -> bool {
            false
        }

        fn has_map_jit_support() -> bool {
            false
        }

        /// Allocates virtual memory with the given access `memory_flags`.
        pub fn alloc(size: usize, memory_flags: MemoryFlags) -> Result<*mut u8, Error> {
            if size == 0 {
                return Err(Error::InvalidArgument);
            }

            unsafe {
                let protect = protect_flags_from_memory_flags(memory_flags);
                let result = VirtualAlloc(
                    core::ptr::null_mut(),
                    size as SIZE_T,
                    MEM_COMMIT | MEM_RESERVE,
                    protect,
                );

                if result.is_null() {
                    return Err(Error::OutOfMemory);
                }

                Ok(result.cast())
            }
        }

        /// Releases virtual memory previously allocated by [alloc].
        pub fn release(ptr: *mut u8, size: usize) -> Result<(), Error> {
            if size == 0 || ptr.is_null() {
                return Err(Error::InvalidArgument);
            }

            unsafe {
                if VirtualFree(ptr.cast(), 0, MEM_RELEASE) == 0 {
                    return Err(Error::InvalidArgument);
                }
            }

            Ok(())
        }

        /// Changes the protection of an existing mapped region.
        pub fn protect(ptr: *mut u8, size: usize, memory_flags: MemoryFlags) -> Result<(), Error> {
            let protect_flags = protect_flags_from_memory_flags(memory_flags);
            let mut old_flags = 0;

            unsafe {
                if VirtualProtect(ptr.cast(), size as SIZE_T, protect_flags, &mut old_flags) != 0 {
                    return Ok(());
                }
            }

            Err(Error::InvalidArgument)
        }

        /// Allocates anonymous shared memory and maps it into two views: an
        /// RX view without write access and an RW view without execute
        /// access. The result must be released with [release_dual_mapping],
        /// never with [release].
        pub fn alloc_dual_mapping(
            size: usize,
            memory_flags: MemoryFlags,
        ) -> Result<DualMapping, Error> {
            if size == 0 {
                return Err(Error::InvalidArgument);
            }

            let mut handle = ScopedHandle::new();

            unsafe {
                handle.value = CreateFileMappingW(
                    INVALID_HANDLE_VALUE,
                    core::ptr::null_mut(),
                    PAGE_EXECUTE_READWRITE,
                    ((size as u64) >> 32) as DWORD,
                    (size as u64 & 0xFFFF_FFFF) as DWORD,
                    core::ptr::null(),
                );

                if handle.value.is_null() {
                    return Err(Error::OutOfMemory);
                }

                let mut ptr = [core::ptr::null_mut(), core::ptr::null_mut()];
                for i in 0..2 {
                    let view_flags = MemoryFlags(memory_flags.0 & !DUAL_MAPPING_FILTER[i]);
                    let desired_access = desired_access_from_memory_flags(view_flags);

                    ptr[i] = MapViewOfFile(handle.value, desired_access, 0, 0, size as SIZE_T);
                    if ptr[i].is_null() {
                        if i == 1 {
                            UnmapViewOfFile(ptr[0]);
                        }
                        return Err(Error::OutOfMemory);
                    }
                }

                // The file-mapping handle is closed by ScopedHandle; the
                // views keep the backing object alive.
                Ok(DualMapping {
                    rx: ptr[0] as *const u8,
                    rw: ptr[1] as *mut u8,
                })
            }
        }

        /// Releases a dual mapping previously allocated by
        /// [alloc_dual_mapping]. Both pointers are set to null on success.
        pub fn release_dual_mapping(dm: &mut DualMapping, _size: usize) -> Result<(), Error> {
            let mut failed = false;

            unsafe {
                if UnmapViewOfFile(dm.rx.cast()) == 0 {
                    failed = true;
                }
                if dm.rx != dm.rw as *const u8 && UnmapViewOfFile(dm.rw as *const _) == 0 {
                    failed = true;
                }
            }

            if failed {
                return Err(Error::InvalidArgument);
            }

            dm.rx = core::ptr::null();
            dm.rw = core::ptr::null_mut();
            Ok(())
        }
    }
}

/// Protects the access of memory mapped with `MAP_JIT` for the current
/// thread.
///
/// Only does something on Apple Silicon, where it uses the non-portable
/// `pthread_jit_write_protect_np()` call. Call it with
/// [ProtectJitAccess::ReadWrite] before writing generated code and with
/// [ProtectJitAccess::ReadExecute] after, followed by
/// [flush_instruction_cache].
pub fn protect_jit_memory(access: ProtectJitAccess) {
    #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
    unsafe {
        let enable_write = match access {
            ProtectJitAccess::ReadWrite => 0,
            ProtectJitAccess::ReadExecute => 1,
        };
        libc::pthread_jit_write_protect_np(enable_write);
    }

    let _ = access;
}

/// Makes JIT memory writable for the current thread for the lifetime of the
/// guard. On drop the protection returns to read+execute and the
/// instruction cache of the covered span is flushed, on every exit path.
pub struct ProtectJitReadWriteScope {
    ptr: *const u8,
    size: usize,
}

impl ProtectJitReadWriteScope {
    pub fn new(ptr: *const u8, size: usize) -> Self {
        protect_jit_memory(ProtectJitAccess::ReadWrite);
        Self { ptr, size }
    }
}

impl Drop for ProtectJitReadWriteScope {
    fn drop(&mut self) {
        protect_jit_memory(ProtectJitAccess::ReadExecute);
        flush_instruction_cache(self.ptr, self.size);
    }
}

/// Flushes the instruction cache in the given region.
///
/// Does nothing on x86/x86_64 where data and instruction caches are
/// coherent, but calling it unconditionally keeps callers portable.
pub fn flush_instruction_cache(p: *const u8, size: usize) {
    cfgenius::cond! {
        if cfg(any(target_arch = "x86", target_arch = "x86_64")) {
            let _ = (p, size);
        } else if cfg(target_vendor = "apple") {
            extern "C" {
                fn sys_icache_invalidate(p: *const u8, size: usize);
            }

            unsafe {
                sys_icache_invalidate(p, size);
            }
        } else if cfg(windows) {
            use winapi::um::processthreadsapi::{FlushInstructionCache, GetCurrentProcess};

            unsafe {
                FlushInstructionCache(GetCurrentProcess(), p.cast(), size as SIZE_T);
            }
        } else if cfg(target_arch = "aarch64") {
            use core::arch::asm;

            const CACHE_LINE_SIZE: usize = 64;

            let start = p as usize & !(CACHE_LINE_SIZE - 1);
            let end = p as usize + size;

            unsafe {
                let mut addr = start;
                while addr < end {
                    asm!("dc civac, {}", in(reg) addr);
                    addr += CACHE_LINE_SIZE;
                }
                asm!("dsb ish");

                let mut addr = start;
                while addr < end {
                    asm!("ic ivau, {}", in(reg) addr);
                    addr += CACHE_LINE_SIZE;
                }
                asm!("dsb ish");
                asm!("isb");
            }
        } else if cfg(target_arch = "riscv64") {
            let _ = wasmtime_jit_icache_coherence::clear_cache(p.cast(), size);
            let _ = wasmtime_jit_icache_coherence::pipeline_flush_mt();
        } else {
            let _ = (p, size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_is_sane() {
        let vm_info = info();
        assert!(vm_info.page_size.is_power_of_two());
        assert!(vm_info.page_granularity >= vm_info.page_size);
    }

    #[test]
    fn alloc_protect_release_round_trip() {
        let size = info().page_size as usize;

        let ptr = alloc(size, MemoryFlags(MemoryFlags::ACCESS_RW)).unwrap();
        unsafe {
            ptr.write(0x7F);
            assert_eq!(ptr.read(), 0x7F);
        }

        protect(ptr, size, MemoryFlags(MemoryFlags::ACCESS_READ)).unwrap();
        unsafe {
            assert_eq!(ptr.read(), 0x7F);
        }

        release(ptr, size).unwrap();
    }

    #[test]
    fn dual_mapping_views_alias() {
        let size = info().page_granularity as usize;

        let mut dm = alloc_dual_mapping(size, MemoryFlags(MemoryFlags::ACCESS_RWX)).unwrap();
        assert!(!dm.rx.is_null());
        assert!(!dm.rw.is_null());

        unsafe {
            dm.rw.write(0xAB);
            dm.rw.add(size - 1).write(0xCD);
            assert_eq!(dm.rx.read(), 0xAB);
            assert_eq!(dm.rx.add(size - 1).read(), 0xCD);
        }

        release_dual_mapping(&mut dm, size).unwrap();
        assert!(dm.rx.is_null());
        assert!(dm.rw.is_null());
    }

    #[test]
    fn zero_sized_requests_are_rejected() {
        assert_eq!(
            alloc(0, MemoryFlags(MemoryFlags::ACCESS_RW)).unwrap_err(),
            Error::InvalidArgument
        );
        assert_eq!(
            alloc_dual_mapping(0, MemoryFlags(MemoryFlags::ACCESS_RWX)).unwrap_err(),
            Error::InvalidArgument
        );
    }
}

use crate::PLATFORM;
use core::panic::PanicInfo;
use svm_nest::platform::Platform;

#[no_mangle]
#[allow(bad_style)]
static _fltused: i32 = 0;

#[panic_handler]
fn panic(info: &PanicInfo<'_>) -> ! {
    log::error!("Panic handler called: {}", info);

    PLATFORM.debug_break();
    PLATFORM.bugcheck()
}

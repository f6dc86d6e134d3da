cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        #[macro_use]
        mod debug_print;
        mod linux;

        pub use linux::*;

        mod serializers;
    }
}

failspot::failspot_name! {
    pub enum FailSpotName {
        AltStackInstall,
        ChildStackReserve,
        RendezvousChannel,
        SpawnTracer,
        ThreadName,
        SuspendThreads,
    }
}

// Closed command enum for the command channel (spec.md §4.8, §6;
// original_source/include/ocland/client/commands_enum.h).
//
// Wire value is the enum's declaration order, matching the original's
// unadorned C `enum`. Adding a command is an append-only operation — the
// numeric values of existing entries must never change once peers are
// deployed against them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Command {
    GetPlatformIDs = 0,
    GetPlatformInfo,
    GetDeviceIDs,
    GetDeviceInfo,
    CreateContext,
    CreateContextFromType,
    RetainContext,
    ReleaseContext,
    GetContextInfo,
    CreateCommandQueue,
    RetainCommandQueue,
    ReleaseCommandQueue,
    GetCommandQueueInfo,
    CreateBuffer,
    RetainMemObject,
    ReleaseMemObject,
    GetSupportedImageFormats,
    GetMemObjectInfo,
    GetImageInfo,
    CreateSampler,
    RetainSampler,
    ReleaseSampler,
    GetSamplerInfo,
    CreateProgramWithSource,
    CreateProgramWithBinary,
    RetainProgram,
    ReleaseProgram,
    BuildProgram,
    GetProgramBuildInfo,
    CreateKernel,
    CreateKernelsInProgram,
    RetainKernel,
    ReleaseKernel,
    SetKernelArg,
    GetKernelInfo,
    GetKernelWorkGroupInfo,
    WaitForEvents,
    GetEventInfo,
    RetainEvent,
    ReleaseEvent,
    GetEventProfilingInfo,
    Flush,
    Finish,
    EnqueueReadBuffer,
    EnqueueWriteBuffer,
    EnqueueCopyBuffer,
    EnqueueCopyImage,
    EnqueueCopyImageToBuffer,
    EnqueueCopyBufferToImage,
    EnqueueNDRangeKernel,
    CreateSubBuffer,
    CreateUserEvent,
    SetUserEventStatus,
    EnqueueReadBufferRect,
    EnqueueWriteBufferRect,
    EnqueueCopyBufferRect,
    EnqueueReadImage,
    EnqueueWriteImage,
    CreateSubDevices,
    RetainDevice,
    ReleaseDevice,
    CreateImage,
    CreateProgramWithBuiltInKernels,
    CompileProgram,
    LinkProgram,
    UnloadPlatformCompiler,
    GetProgramInfo,
    GetKernelArgInfo,
    EnqueueFillBuffer,
    EnqueueFillImage,
    EnqueueMigrateMemObjects,
    EnqueueMarkerWithWaitList,
    EnqueueBarrierWithWaitList,
    CreateImage2D,
    CreateImage3D,
}

pub const COMMAND_COUNT: u32 = 75;

impl Command {
    pub fn from_wire(code: u32) -> Option<Command> {
        use Command::*;
        const TABLE: [Command; COMMAND_COUNT as usize] = [
            GetPlatformIDs,
            GetPlatformInfo,
            GetDeviceIDs,
            GetDeviceInfo,
            CreateContext,
            CreateContextFromType,
            RetainContext,
            ReleaseContext,
            GetContextInfo,
            CreateCommandQueue,
            RetainCommandQueue,
            ReleaseCommandQueue,
            GetCommandQueueInfo,
            CreateBuffer,
            RetainMemObject,
            ReleaseMemObject,
            GetSupportedImageFormats,
            GetMemObjectInfo,
            GetImageInfo,
            CreateSampler,
            RetainSampler,
            ReleaseSampler,
            GetSamplerInfo,
            CreateProgramWithSource,
            CreateProgramWithBinary,
            RetainProgram,
            ReleaseProgram,
            BuildProgram,
            GetProgramBuildInfo,
            CreateKernel,
            CreateKernelsInProgram,
            RetainKernel,
            ReleaseKernel,
            SetKernelArg,
            GetKernelInfo,
            GetKernelWorkGroupInfo,
            WaitForEvents,
            GetEventInfo,
            RetainEvent,
            ReleaseEvent,
            GetEventProfilingInfo,
            Flush,
            Finish,
            EnqueueReadBuffer,
            EnqueueWriteBuffer,
            EnqueueCopyBuffer,
            EnqueueCopyImage,
            EnqueueCopyImageToBuffer,
            EnqueueCopyBufferToImage,
            EnqueueNDRangeKernel,
            CreateSubBuffer,
            CreateUserEvent,
            SetUserEventStatus,
            EnqueueReadBufferRect,
            EnqueueWriteBufferRect,
            EnqueueCopyBufferRect,
            EnqueueReadImage,
            EnqueueWriteImage,
            CreateSubDevices,
            RetainDevice,
            ReleaseDevice,
            CreateImage,
            CreateProgramWithBuiltInKernels,
            CompileProgram,
            LinkProgram,
            UnloadPlatformCompiler,
            GetProgramInfo,
            GetKernelArgInfo,
            EnqueueFillBuffer,
            EnqueueFillImage,
            EnqueueMigrateMemObjects,
            EnqueueMarkerWithWaitList,
            EnqueueBarrierWithWaitList,
            CreateImage2D,
            CreateImage3D,
        ];
        TABLE.get(code as usize).copied()
    }
}

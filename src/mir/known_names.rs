// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! Library methods whose memory effects are specified by hand.
//!
//! A known call is recognised from the full signature of its callee. Each
//! known call has a fixed summary of which arguments it reads or writes,
//! either only through the argument itself or through everything reachable
//! from it, and which standard streams it touches.

use std::collections::HashMap;

use arrayvec::ArrayVec;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

use crate::pts_set::uiv::SpecialStream;

#[derive(Clone, Copy, Debug, Eq, PartialOrd, PartialEq, Hash, Ord, Serialize, Deserialize)]
pub enum KnownCall {
    Open,
    Tmpfile,
    Close,
    Read,
    Write,
    Fgets,
    Exit,
    Rand,
    Isupper,
    Isalnum,
    Isspace,
    Isalpha,
    Tolower,
    Toupper,
    Fgetc,
    Errno,
    Ctime,
    Time,
    Difftime,
    Sscanf,
    Fscanf,
    Sprintf,
    Fprintf,
    Strtod,
    Strrchr,
    Strerror,
    Strcat,
    Strcpy,
    Strcmp,
    Strstr,
    Strpbrk,
    Perror,
    Printf,
    Puts,
    Feof,
    Fopen,
    Fread,
    Fseek,
    Fclose,
    Remove,
    Fileno,
    Fwrite,
    Fputs,
    Fputc,
    Fflush,
    Rewind,
    Setjmp,
    Setbuf,
    Atoi,
    Getenv,
    Qsort,
    Clock,
    IoFtableGetEntry,
    Calloc,
    Malloc,
    MaxMin,
    Abs,
    // Calls that only write a byte or bits to the output buffer.
    Putchar,
    NeedToReadBits,
    ReadBits,
    SetStream,
    GetBytesWritten,
    SetBytesWritten,
    WriteBits,
    WriteBitsFromValue,
    Flush,
}

/// How a known call reaches the memory behind one of its arguments.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Arg {
    /// Only the addresses the argument holds.
    Accessed(usize),
    /// The addresses the argument holds and everything reachable from them.
    Reachable(usize),
    /// `Accessed` for this argument and every later one (varargs).
    AccessedFrom(usize),
    /// `Reachable` for this argument and every later one (varargs).
    ReachableFrom(usize),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Effect {
    Read(Arg),
    Write(Arg),
    ReadWrite(Arg),
    /// Reads and writes a standard stream.
    Stream(SpecialStream),
    /// Reads and writes the standard stream named by the file descriptor
    /// passed as this argument; every stream if it is not a constant.
    FdStream(usize),
}

pub type Effects = ArrayVec<Effect, 3>;

macro_rules! effects {
    ($($effect:expr),* $(,)?) => {{
        #[allow(unused_mut)]
        let mut effects = Effects::new();
        $(effects.push($effect);)*
        effects
    }};
}

use Arg::*;
use Effect::*;

impl KnownCall {
    pub const ALL: [KnownCall; 66] = [
        KnownCall::Open,
        KnownCall::Tmpfile,
        KnownCall::Close,
        KnownCall::Read,
        KnownCall::Write,
        KnownCall::Fgets,
        KnownCall::Exit,
        KnownCall::Rand,
        KnownCall::Isupper,
        KnownCall::Isalnum,
        KnownCall::Isspace,
        KnownCall::Isalpha,
        KnownCall::Tolower,
        KnownCall::Toupper,
        KnownCall::Fgetc,
        KnownCall::Errno,
        KnownCall::Ctime,
        KnownCall::Time,
        KnownCall::Difftime,
        KnownCall::Sscanf,
        KnownCall::Fscanf,
        KnownCall::Sprintf,
        KnownCall::Fprintf,
        KnownCall::Strtod,
        KnownCall::Strrchr,
        KnownCall::Strerror,
        KnownCall::Strcat,
        KnownCall::Strcpy,
        KnownCall::Strcmp,
        KnownCall::Strstr,
        KnownCall::Strpbrk,
        KnownCall::Perror,
        KnownCall::Printf,
        KnownCall::Puts,
        KnownCall::Feof,
        KnownCall::Fopen,
        KnownCall::Fread,
        KnownCall::Fseek,
        KnownCall::Fclose,
        KnownCall::Remove,
        KnownCall::Fileno,
        KnownCall::Fwrite,
        KnownCall::Fputs,
        KnownCall::Fputc,
        KnownCall::Fflush,
        KnownCall::Rewind,
        KnownCall::Setjmp,
        KnownCall::Setbuf,
        KnownCall::Atoi,
        KnownCall::Getenv,
        KnownCall::Qsort,
        KnownCall::Clock,
        KnownCall::IoFtableGetEntry,
        KnownCall::Calloc,
        KnownCall::Malloc,
        KnownCall::MaxMin,
        KnownCall::Abs,
        KnownCall::Putchar,
        KnownCall::NeedToReadBits,
        KnownCall::ReadBits,
        KnownCall::SetStream,
        KnownCall::GetBytesWritten,
        KnownCall::SetBytesWritten,
        KnownCall::WriteBits,
        KnownCall::WriteBitsFromValue,
        KnownCall::Flush,
    ];

    /// Known calls that return a fresh object.
    pub fn allocates(self) -> bool {
        matches!(self, KnownCall::Malloc | KnownCall::Calloc | KnownCall::Fopen)
    }

    /// The memory effects of the call. Every known call has exactly one
    /// summary here.
    pub fn effects(self) -> Effects {
        match self {
            KnownCall::Open
            | KnownCall::Atoi
            | KnownCall::Getenv
            | KnownCall::Remove
            | KnownCall::Ctime
            | KnownCall::Strrchr => effects![Read(Accessed(0))],
            KnownCall::Strtod => effects![Read(Accessed(0)), ReadWrite(Accessed(1))],
            KnownCall::Fread => effects![ReadWrite(Reachable(3)), Write(Accessed(0))],
            KnownCall::Strcpy | KnownCall::Strcat => effects![Read(Accessed(1)), Write(Accessed(0))],
            KnownCall::Strpbrk | KnownCall::Strstr | KnownCall::Strcmp => {
                effects![Read(Accessed(0)), Read(Accessed(1))]
            }
            KnownCall::Setbuf => effects![ReadWrite(Reachable(0)), Read(Accessed(1))],
            KnownCall::Setjmp | KnownCall::Time => effects![Write(Accessed(0))],
            KnownCall::Write => effects![Read(Accessed(1)), FdStream(0)],
            KnownCall::Read => effects![Write(Accessed(1)), FdStream(0)],
            KnownCall::Feof => effects![Read(Reachable(0))],
            KnownCall::Fgets => effects![Write(Accessed(0)), ReadWrite(Reachable(2))],
            KnownCall::Fgetc | KnownCall::Fclose | KnownCall::Fseek | KnownCall::Fflush | KnownCall::Rewind => {
                effects![ReadWrite(Reachable(0))]
            }
            KnownCall::Sscanf => effects![Read(Accessed(0)), Read(Accessed(1)), Write(ReachableFrom(2))],
            KnownCall::Fscanf => effects![ReadWrite(Reachable(0)), Read(Accessed(1)), Write(ReachableFrom(2))],
            KnownCall::Sprintf => effects![Read(AccessedFrom(1)), Write(Accessed(0))],
            KnownCall::Fprintf => effects![ReadWrite(Reachable(0)), Read(AccessedFrom(1))],
            KnownCall::Perror => effects![Read(Accessed(0)), Stream(SpecialStream::Stderr)],
            KnownCall::Printf => effects![Read(AccessedFrom(0)), Stream(SpecialStream::Stdout)],
            KnownCall::Fopen => effects![Read(Accessed(0)), Read(Accessed(1))],
            KnownCall::Fwrite => effects![Read(Accessed(0)), ReadWrite(Reachable(3))],
            KnownCall::Fputs => effects![Read(Accessed(0)), ReadWrite(Reachable(1))],
            KnownCall::Puts => effects![Read(Accessed(0)), Stream(SpecialStream::Stdout)],
            KnownCall::Fputc => effects![ReadWrite(Reachable(1))],
            KnownCall::Putchar | KnownCall::ReadBits | KnownCall::Flush => {
                effects![Stream(SpecialStream::Stdout)]
            }
            KnownCall::Qsort => effects![ReadWrite(Accessed(0)), Read(Accessed(3))],
            KnownCall::WriteBits => effects![Read(Accessed(1)), Stream(SpecialStream::Stdout)],
            KnownCall::WriteBitsFromValue
            | KnownCall::SetStream
            | KnownCall::SetBytesWritten
            | KnownCall::GetBytesWritten
            | KnownCall::NeedToReadBits
            | KnownCall::Errno
            | KnownCall::Strerror
            | KnownCall::Tmpfile
            | KnownCall::Difftime
            | KnownCall::Fileno
            | KnownCall::MaxMin
            | KnownCall::Abs
            | KnownCall::Rand
            | KnownCall::Tolower
            | KnownCall::Toupper
            | KnownCall::Isupper
            | KnownCall::Isalpha
            | KnownCall::Isalnum
            | KnownCall::Isspace
            | KnownCall::Exit
            | KnownCall::Close
            | KnownCall::Clock
            | KnownCall::Calloc
            | KnownCall::Malloc
            | KnownCall::IoFtableGetEntry => effects![],
        }
    }
}

lazy_static! {
    static ref KNOWN_SIGNATURES: HashMap<&'static str, KnownCall> = {
        let table: &[(&'static str, KnownCall)] = &[
            ("System.Int32 libstd.open(System.SByte* name,System.Int32 flags)", KnownCall::Open),
            ("__iob* libstd.tmpfile()", KnownCall::Tmpfile),
            ("System.Int32 libstd.close(System.Int32 fd)", KnownCall::Close),
            ("System.Int32 libstd.read(System.Int32 fd,System.Void* buf,System.UInt32 count)", KnownCall::Read),
            ("System.Int32 libstd.write(System.Int32 fd,System.Void* buf,System.UInt32 count)", KnownCall::Write),
            ("System.SByte* libstd.fgets(System.SByte* s,System.Int32 n,__iob* stream)", KnownCall::Fgets),
            ("System.Void System.Environment.Exit(System.Int32 exitCode)", KnownCall::Exit),
            ("System.Void libstd.exit(System.Int32 status)", KnownCall::Exit),
            ("System.Void libstd.abort()", KnownCall::Exit),
            ("System.Void libstd.srand(System.UInt32 seed)", KnownCall::Rand),
            ("System.Int32 libstd.rand()", KnownCall::Rand),
            ("System.Int32 libstd.isupper(System.Int32 c)", KnownCall::Isupper),
            ("System.Int32 libstd.isalnum(System.Int32 c)", KnownCall::Isalnum),
            ("System.Int32 libstd.isspace(System.Int32 c)", KnownCall::Isspace),
            ("System.Int32 libstd.isalpha(System.Int32 c)", KnownCall::Isalpha),
            ("System.Int32 libstd.tolower(System.Int32 c)", KnownCall::Tolower),
            ("System.Int32 libstd.toupper(System.Int32 c)", KnownCall::Toupper),
            ("System.Int32 libstd.fgetc(__iob* stream)", KnownCall::Fgetc),
            ("System.Int32 libstd.getc(__iob* stream)", KnownCall::Fgetc),
            ("System.Int32* libstd.__errno__get_ptr()", KnownCall::Errno),
            ("System.SByte* libstd.ctime(System.UInt32* timer)", KnownCall::Ctime),
            ("System.UInt32 libstd.time(System.UInt32* tptr)", KnownCall::Time),
            ("System.Double libstd.difftime(System.UInt32 time1,System.UInt32 time0)", KnownCall::Difftime),
            ("System.Int32 libstd.sscanf(System.SByte* s,System.SByte* format)", KnownCall::Sscanf),
            ("System.Int32 libstd.fscanf(__iob* stream,System.SByte* format)", KnownCall::Fscanf),
            ("System.Int32 libstd.sprintf(System.SByte* s,System.SByte* format)", KnownCall::Sprintf),
            ("System.Int32 libstd.fprintf(__iob* stream,System.SByte* format)", KnownCall::Fprintf),
            ("System.Double libstd.strtod(System.SByte* s,System.SByte** endptr)", KnownCall::Strtod),
            ("System.SByte* libstd.strrchr(System.SByte* s,System.Int32 c)", KnownCall::Strrchr),
            ("System.SByte* libstd.strerror(System.Int32 errnum)", KnownCall::Strerror),
            ("System.SByte* libstd.strcat(System.SByte* s1,System.SByte* s2)", KnownCall::Strcat),
            ("System.SByte* libstd.strcpy(System.SByte* s1,System.SByte* s2)", KnownCall::Strcpy),
            ("System.SByte* libstd.strncpy(System.SByte* s1,System.SByte* s2,System.UInt32 n)", KnownCall::Strcpy),
            ("System.Int32 libstd.strncmp(System.SByte* s1,System.SByte* s2,System.UInt32 n)", KnownCall::Strcmp),
            ("System.SByte* libstd.strstr(System.SByte* s1,System.SByte* s2)", KnownCall::Strstr),
            ("System.SByte* libstd.strpbrk(System.SByte* s1,System.SByte* s2)", KnownCall::Strpbrk),
            ("System.Void libstd.perror(System.SByte* s)", KnownCall::Perror),
            ("System.Int32 libstd.printf(System.SByte* format)", KnownCall::Printf),
            ("System.Int32 libstd.puts(System.SByte* s)", KnownCall::Puts),
            ("System.Int32 libstd.feof(__iob* stream)", KnownCall::Feof),
            ("__iob* libstd.fopen(System.SByte* filename,System.SByte* mode)", KnownCall::Fopen),
            (
                "System.UInt32 libstd.fread(System.Void* ptr,System.UInt32 size,System.UInt32 nmemb,__iob* stream)",
                KnownCall::Fread,
            ),
            ("System.Int32 libstd.fseek(__iob* stream,System.Int32 offset,System.Int32 whence)", KnownCall::Fseek),
            ("System.Int32 libstd.fclose(__iob* stream)", KnownCall::Fclose),
            ("System.Int32 libstd.remove(System.SByte* filename)", KnownCall::Remove),
            ("System.Int32 libstd.fileno(__iob* stream)", KnownCall::Fileno),
            (
                "System.UInt32 libstd.fwrite(System.Void* ptr,System.UInt32 size,System.UInt32 nmemb,__iob* stream)",
                KnownCall::Fwrite,
            ),
            ("System.Int32 libstd.fputs(System.SByte* s,__iob* stream)", KnownCall::Fputs),
            ("System.Int32 libstd.fputc(System.Int32 c,__iob* stream)", KnownCall::Fputc),
            ("System.Int32 libstd.fflush(__iob* stream)", KnownCall::Fflush),
            ("System.Void libstd.rewind(__iob* stream)", KnownCall::Rewind),
            ("System.Int32 libstd.setjmp(System.Int32 buf)", KnownCall::Setjmp),
            ("System.Void libstd.setbuf(__iob* stream,System.SByte* buf)", KnownCall::Setbuf),
            ("System.Int32 libstd.atoi(System.SByte* nptr)", KnownCall::Atoi),
            ("System.Double libstd.atof(System.SByte* nptr)", KnownCall::Atoi),
            ("System.Int32 libstd.atol(System.SByte* nptr)", KnownCall::Atoi),
            ("System.SByte* libstd.getenv(System.SByte* name)", KnownCall::Getenv),
            (
                "System.Void libstd.qsort(System.Void* base,System.UInt32 nmemb,System.UInt32 size,System.Int32 FUNCTION POINTER(System.Void*,System.Void*) compar)",
                KnownCall::Qsort,
            ),
            ("System.UInt32 libstd.clock()", KnownCall::Clock),
            ("__iob* libstd.__io_ftable_get_entry(System.Int32 fileno)", KnownCall::IoFtableGetEntry),
            ("System.Void* libstd.calloc(System.UInt32 nmemb,System.UInt32 size)", KnownCall::Calloc),
            ("System.Void* libstd.malloc(System.UInt32 size)", KnownCall::Malloc),
            ("System.Int32 gcc4net.Crt.__maxsi3(System.Int32 a,System.Int32 b)", KnownCall::MaxMin),
            ("System.Int32 gcc4net.Crt.__minsi3(System.Int32 a,System.Int32 b)", KnownCall::MaxMin),
            ("System.UInt32 gcc4net.Crt.__uminsi3(System.UInt32 a,System.UInt32 b)", KnownCall::MaxMin),
            ("System.UInt32 gcc4net.Crt.__umaxsi3(System.UInt32 a,System.UInt32 b)", KnownCall::MaxMin),
            ("System.Int32 gcc4net.Crt.__abssi2(System.Int32 a)", KnownCall::Abs),
            ("System.Int32 libstd.putchar(System.Int32 c)", KnownCall::Putchar),
            ("System.Void bzip2_4.BUFFER_writeUChar(System.Byte c)", KnownCall::Putchar),
            ("System.Void bzip2_4.BUFFER_writeBit(System.UInt32 bitToWrite)", KnownCall::Putchar),
            ("System.Void bzip2_4.BUFFER_writeUInt(System.UInt32 u)", KnownCall::Putchar),
            (
                "System.Void bzip2_4.BUFFER_needToReadNumberOfBits(System.Int32 nz,System.Void FUNCTION POINTER() customEOF)",
                KnownCall::NeedToReadBits,
            ),
            (
                "System.UInt32 bzip2_4.BUFFER_readBits(System.UInt32 n,System.Void FUNCTION POINTER() customEOF)",
                KnownCall::ReadBits,
            ),
            ("System.Int32 bzip2_4.BUFFER_bsR1(System.Void FUNCTION POINTER() customEOF)", KnownCall::ReadBits),
            ("System.Void bzip2_4.BUFFER_setStream(System.Int32 f,System.Byte wr)", KnownCall::SetStream),
            ("System.UInt32 bzip2_4.BUFFER_getNumberOfBytesWritten()", KnownCall::GetBytesWritten),
            ("System.Void bzip2_4.BUFFER_setNumberOfBytesWritten(System.UInt32 v)", KnownCall::SetBytesWritten),
            ("System.Void bzip2_4.BUFFER_writeBits(System.UInt32 numBits,System.Void* memToReadFrom)", KnownCall::WriteBits),
            (
                "System.Void bzip2_4.BUFFER_writeBitsFromValue(System.UInt32 numBits,System.Int32 value)",
                KnownCall::WriteBitsFromValue,
            ),
            ("System.Void bzip2_4.BUFFER_flush()", KnownCall::Flush),
        ];
        table.iter().copied().collect()
    };
}

/// Recognises a known call from the full signature of its callee.
pub fn classify(signature: &str) -> Option<KnownCall> {
    KNOWN_SIGNATURES.get(signature).copied()
}

/// Every signature recognised as `call`.
pub fn signatures_of(call: KnownCall) -> Vec<&'static str> {
    let mut sigs: Vec<&'static str> = KNOWN_SIGNATURES
        .iter()
        .filter(|(_, known)| **known == call)
        .map(|(sig, _)| *sig)
        .collect();
    sigs.sort();
    sigs
}

/// Whether the return type written before the method name is a pointer.
pub fn signature_returns_pointer(signature: &str) -> bool {
    let head = signature.split('(').next().unwrap_or(signature);
    match head.trim().rsplit_once(' ') {
        Some((ret, _)) => ret.contains('*'),
        None => false,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn every_known_call_has_a_signature_test() {
        let all: HashSet<KnownCall> = KnownCall::ALL.iter().copied().collect();
        assert_eq!(all.len(), KnownCall::ALL.len());
        for call in KnownCall::ALL {
            assert!(!signatures_of(call).is_empty(), "{:?} is never classified", call);
        }
        for known in KNOWN_SIGNATURES.values() {
            assert!(all.contains(known));
        }
    }

    #[test]
    fn classify_test() {
        assert_eq!(classify("System.Void* libstd.malloc(System.UInt32 size)"), Some(KnownCall::Malloc));
        assert_eq!(classify("System.Int32 libstd.getc(__iob* stream)"), Some(KnownCall::Fgetc));
        assert_eq!(classify("System.Void libstd.abort()"), Some(KnownCall::Exit));
        assert_eq!(classify("System.Void libstd.abort( )"), None);
        assert_eq!(classify("main"), None);
    }

    #[test]
    fn effects_test() {
        assert_eq!(
            KnownCall::Fread.effects().as_slice(),
            &[ReadWrite(Reachable(3)), Write(Accessed(0))]
        );
        assert_eq!(
            KnownCall::Printf.effects().as_slice(),
            &[Read(AccessedFrom(0)), Stream(SpecialStream::Stdout)]
        );
        assert!(KnownCall::Malloc.effects().is_empty());
        assert!(KnownCall::Malloc.allocates());
        assert!(!KnownCall::Strcpy.allocates());
    }

    #[test]
    fn returns_pointer_test() {
        assert!(signature_returns_pointer("System.Void* libstd.malloc(System.UInt32 size)"));
        assert!(signature_returns_pointer("__iob* libstd.tmpfile()"));
        assert!(!signature_returns_pointer("System.Int32 libstd.puts(System.SByte* s)"));
        assert!(!signature_returns_pointer("puts"));
    }
}

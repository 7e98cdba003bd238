//! Register access layer for the OTG core
//!
//! One `RegisterBlock` covers the global, host, device, power and FIFO
//! register groups at their documented offsets. The field modules below
//! follow the `ral-registers` conventions so that `read_reg!`, `write_reg!`
//! and `modify_reg!` work on every register. Enumerated field values live in
//! each field's `RW` module.

#![allow(non_snake_case, non_upper_case_globals, dead_code)]

use crate::vcell::VCell;

pub use ral_registers::{modify_reg, read_reg, write_reg};

type Reg = VCell<u32>;

/// Words in one FIFO push / pop window
pub const FIFO_WINDOW_WORDS: usize = 1024;

/// Host channel registers
#[repr(C)]
pub struct Channel {
    pub HCCHAR: Reg,
    pub HCSPLT: Reg,
    pub HCINT: Reg,
    pub HCINTMSK: Reg,
    pub HCTSIZ: Reg,
    pub HCDMA: Reg,
    _reserved: [u32; 2],
}

/// Device IN endpoint registers
#[repr(C)]
pub struct InEndpoint {
    pub DIEPCTL: Reg,
    _reserved0: u32,
    pub DIEPINT: Reg,
    _reserved1: u32,
    pub DIEPTSIZ: Reg,
    pub DIEPDMA: Reg,
    pub DTXFSTS: Reg,
    _reserved2: u32,
}

/// Device OUT endpoint registers
#[repr(C)]
pub struct OutEndpoint {
    pub DOEPCTL: Reg,
    _reserved0: u32,
    pub DOEPINT: Reg,
    _reserved1: u32,
    pub DOEPTSIZ: Reg,
    pub DOEPDMA: Reg,
    _reserved2: [u32; 2],
}

#[repr(C)]
pub struct RegisterBlock {
    // 0x000
    pub GOTGCTL: Reg,
    pub GOTGINT: Reg,
    pub GAHBCFG: Reg,
    pub GUSBCFG: Reg,
    pub GRSTCTL: Reg,
    pub GINTSTS: Reg,
    pub GINTMSK: Reg,
    pub GRXSTSR: Reg,
    pub GRXSTSP: Reg,
    pub GRXFSIZ: Reg,
    pub GNPTXFSIZ: Reg,
    pub GNPTXSTS: Reg,
    _reserved0: [u32; 2],
    pub GCCFG: Reg,
    pub CID: Reg,
    _reserved1: [u32; 48],
    // 0x100
    pub HPTXFSIZ: Reg,
    pub DIEPTXF: [Reg; 15],
    _reserved2: [u32; 176],
    // 0x400
    pub HCFG: Reg,
    pub HFIR: Reg,
    pub HFNUM: Reg,
    _reserved3: u32,
    pub HPTXSTS: Reg,
    pub HAINT: Reg,
    pub HAINTMSK: Reg,
    _reserved4: [u32; 9],
    pub HPRT: Reg,
    _reserved5: [u32; 47],
    // 0x500
    pub hc: [Channel; 16],
    _reserved6: [u32; 64],
    // 0x800
    pub DCFG: Reg,
    pub DCTL: Reg,
    pub DSTS: Reg,
    _reserved7: u32,
    pub DIEPMSK: Reg,
    pub DOEPMSK: Reg,
    pub DAINT: Reg,
    pub DAINTMSK: Reg,
    _reserved8: [u32; 2],
    pub DVBUSDIS: Reg,
    pub DVBUSPULSE: Reg,
    pub DTHRCTL: Reg,
    pub DIEPEMPMSK: Reg,
    pub DEACHINT: Reg,
    pub DEACHINTMSK: Reg,
    _reserved9: [u32; 48],
    // 0x900
    pub inep: [InEndpoint; 16],
    // 0xB00
    pub outep: [OutEndpoint; 16],
    _reserved10: [u32; 64],
    // 0xE00
    pub PCGCCTL: Reg,
    _reserved11: [u32; 127],
    // 0x1000
    pub fifo: [[Reg; FIFO_WINDOW_WORDS]; 16],
}

/// Extract a field from a raw register value, given the field's mask and offset
#[inline(always)]
pub const fn field(value: u32, mask: u32, offset: u32) -> u32 {
    (value & mask) >> offset
}

macro_rules! fields {
    ($(
        $reg:ident {
            $($field:ident: $offset:literal, $width:literal $({ $($name:ident = $val:literal),+ $(,)? })?;)*
        }
    )*) => {
        $(
            pub mod $reg {
                $(
                    pub mod $field {
                        pub const offset: u32 = $offset;
                        pub const mask: u32 = (((1u64 << $width) - 1) as u32) << offset;
                        pub mod R {}
                        pub mod W {}
                        pub mod RW {
                            $($(pub const $name: u32 = $val;)+)?
                        }
                    }
                )*
            }
        )*
    };
}

/// Global, host port, and device-wide registers
pub mod otg {
    fields! {
        GOTGCTL {
            AVALOEN: 4, 1;
            AVALOVAL: 5, 1;
            BVALOEN: 6, 1;
            BVALOVAL: 7, 1;
            CIDSTS: 16, 1;
            ASVLD: 18, 1;
            BSVLD: 19, 1;
        }
        GOTGINT {
            SEDET: 2, 1;
            SRSSCHG: 8, 1;
            HNSSCHG: 9, 1;
            HNGDET: 17, 1;
            ADTOCHG: 18, 1;
            DBCDNE: 19, 1;
        }
        GAHBCFG {
            GINT: 0, 1;
            HBSTLEN: 1, 4 { SINGLE = 0, INCR = 1, INCR4 = 3, INCR8 = 5, INCR16 = 7 };
            DMAEN: 5, 1;
            TXFELVL: 7, 1;
            PTXFELVL: 8, 1;
        }
        GUSBCFG {
            TOCAL: 0, 3;
            PHYSEL: 6, 1;
            SRPCAP: 8, 1;
            HNPCAP: 9, 1;
            TRDT: 10, 4;
            ULPIFSLS: 17, 1;
            ULPIAR: 18, 1;
            ULPICSM: 19, 1;
            ULPIEVBUSD: 20, 1;
            ULPIEVBUSI: 21, 1;
            TSDPS: 22, 1;
            FHMOD: 29, 1;
            FDMOD: 30, 1;
        }
        GRSTCTL {
            CSRST: 0, 1;
            HSRST: 1, 1;
            FCRST: 2, 1;
            RXFFLSH: 4, 1;
            TXFFLSH: 5, 1;
            TXFNUM: 6, 5 { ALL = 0x10 };
            AHBIDL: 31, 1;
        }
        GINTSTS {
            CMOD: 0, 1 { DEVICE = 0, HOST = 1 };
        }
        GRXSTSP {
            EPNUM: 0, 4;
            BCNT: 4, 11;
            DPID: 15, 2;
            PKTSTS: 17, 4;
            FRMNUM: 21, 4;
        }
        GRXFSIZ {
            RXFD: 0, 16;
        }
        GNPTXFSIZ {
            NPTXFSA: 0, 16;
            NPTXFD: 16, 16;
        }
        GNPTXSTS {
            NPTXFSAV: 0, 16;
            NPTQXSAV: 16, 8;
            NPTXQTOP: 24, 7;
        }
        GCCFG {
            PWRDWN: 16, 1;
            VBUSASEN: 18, 1;
            VBUSBSEN: 19, 1;
            SOFOUTEN: 20, 1;
            NOVBUSSENS: 21, 1;
        }
        HPTXFSIZ {
            PTXSA: 0, 16;
            PTXFSIZ: 16, 16;
        }
        HCFG {
            FSLSPCS: 0, 2 { CLK_48MHZ = 1, CLK_6MHZ = 2 };
            FSLSS: 2, 1;
        }
        HFIR {
            FRIVL: 0, 16;
        }
        HFNUM {
            FRNUM: 0, 16;
            FTREM: 16, 16;
        }
        HPTXSTS {
            PTXFSAVL: 0, 16;
            PTXQSAV: 16, 8;
            PTXQTOP: 24, 8;
        }
        HAINT {
            HAINT: 0, 16;
        }
        HAINTMSK {
            HAINTM: 0, 16;
        }
        HPRT {
            PCSTS: 0, 1;
            PCDET: 1, 1;
            PENA: 2, 1;
            PENCHNG: 3, 1;
            POCA: 4, 1;
            POCCHNG: 5, 1;
            PRES: 6, 1;
            PSUSP: 7, 1;
            PRST: 8, 1;
            PLSTS: 10, 2;
            PPWR: 12, 1;
            PTCTL: 13, 4;
            PSPD: 17, 2 { HIGH = 0, FULL = 1, LOW = 2 };
        }
        DCFG {
            DSPD: 0, 2 { HIGH = 0, FULL_ULPI = 1, FULL = 3 };
            NZLSOHSK: 2, 1;
            DAD: 4, 7;
            PFIVL: 11, 2;
        }
        DCTL {
            RWUSIG: 0, 1;
            SDIS: 1, 1;
            GINSTS: 2, 1;
            GONSTS: 3, 1;
            TCTL: 4, 3;
            SGINAK: 7, 1;
            CGINAK: 8, 1;
            SGONAK: 9, 1;
            CGONAK: 10, 1;
            POPRGDNE: 11, 1;
        }
        DSTS {
            SUSPSTS: 0, 1;
            ENUMSPD: 1, 2 { HIGH = 0, FULL_ULPI = 1, LOW = 2, FULL = 3 };
            EERR: 3, 1;
            FNSOF: 8, 14;
        }
        DAINT {
            IEPINT: 0, 16;
            OEPINT: 16, 16;
        }
        DAINTMSK {
            IEPM: 0, 16;
            OEPM: 16, 16;
        }
        DIEPEMPMSK {
            INEPTXFEM: 0, 16;
        }
        DIEPTXF {
            INEPTXSA: 0, 16;
            INEPTXFD: 16, 16;
        }
        PCGCCTL {
            STPPCLK: 0, 1;
            GATEHCLK: 1, 1;
            PHYSUSP: 4, 1;
        }
    }
}

/// Device IN endpoint fields
pub mod inep {
    fields! {
        DIEPCTL {
            MPSIZ: 0, 11;
            USBAEP: 15, 1;
            EONUM_DPID: 16, 1;
            NAKSTS: 17, 1;
            EPTYP: 18, 2 { CONTROL = 0, ISOCHRONOUS = 1, BULK = 2, INTERRUPT = 3 };
            STALL: 21, 1;
            TXFNUM: 22, 4;
            CNAK: 26, 1;
            SNAK: 27, 1;
            SD0PID_SEVNFRM: 28, 1;
            SODDFRM: 29, 1;
            EPDIS: 30, 1;
            EPENA: 31, 1;
        }
        DIEPTSIZ {
            XFRSIZ: 0, 19;
            PKTCNT: 19, 10;
            MCNT: 29, 2;
        }
        DTXFSTS {
            INEPTFSAV: 0, 16;
        }
    }
}

/// Device OUT endpoint fields
pub mod outep {
    fields! {
        DOEPCTL {
            MPSIZ: 0, 11;
            USBAEP: 15, 1;
            EONUM_DPID: 16, 1;
            NAKSTS: 17, 1;
            EPTYP: 18, 2 { CONTROL = 0, ISOCHRONOUS = 1, BULK = 2, INTERRUPT = 3 };
            SNPM: 20, 1;
            STALL: 21, 1;
            CNAK: 26, 1;
            SNAK: 27, 1;
            SD0PID_SEVNFRM: 28, 1;
            SODDFRM: 29, 1;
            EPDIS: 30, 1;
            EPENA: 31, 1;
        }
        DOEPTSIZ {
            XFRSIZ: 0, 19;
            PKTCNT: 19, 10;
            STUPCNT: 29, 2;
        }
    }
}

/// Host channel fields
pub mod hc {
    fields! {
        HCCHAR {
            MPSIZ: 0, 11;
            EPNUM: 11, 4;
            EPDIR: 15, 1 { OUT = 0, IN = 1 };
            LSDEV: 17, 1;
            EPTYP: 18, 2 { CONTROL = 0, ISOCHRONOUS = 1, BULK = 2, INTERRUPT = 3 };
            MCNT: 20, 2;
            DAD: 22, 7;
            ODDFRM: 29, 1;
            CHDIS: 30, 1;
            CHENA: 31, 1;
        }
        HCTSIZ {
            XFRSIZ: 0, 19;
            PKTCNT: 19, 10;
            DPID: 29, 2 { DATA0 = 0, DATA2 = 1, DATA1 = 2, SETUP = 3 };
            DOPNG: 31, 1;
        }
    }
}

const _: [(); 1] = [(); (core::mem::size_of::<Channel>() == 0x20) as usize];
const _: [(); 1] = [(); (core::mem::size_of::<InEndpoint>() == 0x20) as usize];
const _: [(); 1] = [(); (core::mem::size_of::<OutEndpoint>() == 0x20) as usize];
const _: [(); 1] = [(); (core::mem::size_of::<RegisterBlock>() == 0x11000) as usize];

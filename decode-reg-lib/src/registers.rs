//! Register maps of the supported cores.
//!
//! Addresses are byte offsets from the base address of
//! the core as found on the SDB. Each register is 32bit,
//! so the next register is the previous one + 4. Where
//! several constants share an offset, the register holds
//! several fields, told apart by their masks.

pub const LNLS_VENDOR_ID : u64 = 0x1000_0000_0000_13d5;

//========== Acquisition core ===========
//
//=======================================

pub const ACQ_CORE_DEVICE_ID : u32 = 0x4519_a0ad;
pub const ACQ_CORE_ABI_MAJOR : u8  = 2;

pub const ACQ_CTL                    : u64 = 0x00;
pub const ACQ_CTL_FSM_START_ACQ      : u32 = 1 << 0;  // write 1 to start the acquisition FSM
pub const ACQ_CTL_FSM_STOP_ACQ       : u32 = 1 << 1;  // write 1 to stop it
pub const ACQ_CTL_FSM_ACQ_NOW        : u32 = 1 << 16; // acquire without waiting for a trigger

pub const ACQ_STA                    : u64 = 0x04;
pub const ACQ_STA_FSM_STATE          : u32 = 0x0000_0007; //[2:0] see ACQ_FSM_*
pub const ACQ_STA_FSM_ACQ_DONE       : u32 = 1 << 3;
pub const ACQ_STA_FC_TRANS_DONE      : u32 = 1 << 8;  // flow control transfer done
pub const ACQ_STA_FC_FULL            : u32 = 1 << 9;  // flow control fifo full
pub const ACQ_STA_DDR3_TRANS_DONE    : u32 = 1 << 16;

pub const ACQ_TRIG_CFG               : u64 = 0x08;
pub const ACQ_TRIG_CFG_HW_TRIG_SEL   : u32 = 1 << 0;  // 1 external, 0 internal (data driven)
pub const ACQ_TRIG_CFG_HW_TRIG_POL   : u32 = 1 << 1;  // 1 negative edge
pub const ACQ_TRIG_CFG_HW_TRIG_EN    : u32 = 1 << 2;
pub const ACQ_TRIG_CFG_SW_TRIG_EN    : u32 = 1 << 3;
pub const ACQ_TRIG_CFG_INT_TRIG_SEL  : u32 = 0x0000_01f0; //[8:4] atom of the channel the data trigger looks at

pub const ACQ_TRIG_DATA_CFG          : u64 = 0x0c;
pub const ACQ_TRIG_DATA_CFG_FILT_IN  : u32 = 0x0000_00ff; //[7:0] hysteresis counter going in
pub const ACQ_TRIG_DATA_CFG_FILT_OUT : u32 = 0x0000_ff00; //[15:8] hysteresis counter going out

pub const ACQ_TRIG_DATA_THRES        : u64 = 0x10; //[31:0] signed threshold of the data trigger
pub const ACQ_TRIG_DLY               : u64 = 0x14; //[31:0] trigger delay in samples
pub const ACQ_SW_TRIG                : u64 = 0x18; // write anything for a software trigger

pub const ACQ_SHOTS                  : u64 = 0x1c;
pub const ACQ_SHOTS_NB               : u32 = 0x0000_ffff; //[15:0] number of shots
pub const ACQ_SHOTS_RAM_SIZE         : u32 = 0xffff_0000; //[31:16] multishot ram size (ro)

pub const ACQ_TRIG_POS               : u64 = 0x20; //[31:0] DDR address of the last trigger (ro)
pub const ACQ_PRE_SAMPLES            : u64 = 0x24;
pub const ACQ_POST_SAMPLES           : u64 = 0x28;
pub const ACQ_SAMPLES_CNT            : u64 = 0x2c; //[31:0] samples acquired so far (ro)
pub const ACQ_DDR3_START_ADDR        : u64 = 0x30;
pub const ACQ_DDR3_END_ADDR          : u64 = 0x34;

pub const ACQ_CHAN_CTL               : u64 = 0x38;
pub const ACQ_CHAN_CTL_WHICH         : u32 = 0x0000_001f; //[4:0] channel to acquire
pub const ACQ_CHAN_CTL_DTRIG_WHICH   : u32 = 0x0000_1f00; //[12:8] channel the data trigger looks at
pub const ACQ_CHAN_CTL_NUM_CHAN      : u32 = 0x001f_0000; //[20:16] channels of this core (ro)

/// channel descriptors, two words per channel
pub const ACQ_CH0_DESC               : u64 = 0x3c;
pub const ACQ_CH_DESC_INT_WIDTH      : u32 = 0x0000_ffff; //[15:0] bits of one sample
pub const ACQ_CH_DESC_NUM_COALESCE   : u32 = 0xffff_0000; //[31:16] samples per DDR word
pub const ACQ_CH0_ATOM_DESC          : u64 = 0x40;
pub const ACQ_CH_ATOM_DESC_NUM_ATOMS : u32 = 0x0000_ffff; //[15:0] atoms per sample
pub const ACQ_CH_ATOM_DESC_ATOM_WIDTH: u32 = 0xffff_0000; //[31:16] bits per atom
pub const ACQ_CH_DESC_STRIDE         : u64 = 0x08;

pub const ACQ_MAX_NUM_CHAN           : usize = 24;
pub const ACQ_REGS_WORDS             : usize = (ACQ_CH0_DESC as usize + ACQ_MAX_NUM_CHAN*ACQ_CH_DESC_STRIDE as usize)/4;

/// values of ACQ_STA_FSM_STATE
pub const ACQ_FSM_IDLE               : i32 = 1;
pub const ACQ_FSM_PRE_TRIG           : i32 = 2;
pub const ACQ_FSM_WAIT_TRIG          : i32 = 3;
pub const ACQ_FSM_POST_TRIG          : i32 = 4;
pub const ACQ_FSM_DECR_SHOT          : i32 = 5;

//======= Position calculation core ======
//
//=======================================

pub const POS_CALC_DEVICE_ID : u32 = 0x1baf_bf1e;
pub const POS_CALC_ABI_MAJOR : u8  = 1;

pub const POS_CALC_DS_TBT_THRES      : u64 = 0x00; //[25:0] minimum sum for the TBT difference/sum
pub const POS_CALC_DS_FOFB_THRES     : u64 = 0x04; //[25:0]
pub const POS_CALC_DS_MONIT_THRES    : u64 = 0x08; //[25:0]
pub const POS_CALC_DS_THRES_VAL      : u32 = 0x03ff_ffff;
pub const POS_CALC_KX                : u64 = 0x0c; //[24:0] in nm
pub const POS_CALC_KY                : u64 = 0x10; //[24:0] in nm
pub const POS_CALC_K_VAL             : u32 = 0x01ff_ffff;
pub const POS_CALC_KSUM              : u64 = 0x14; //[31:0] fixed point, 24 fractional bits
pub const POS_CALC_KSUM_POINT_POS    : u32 = 24;
pub const POS_CALC_OFFSET_X          : u64 = 0x18; //[31:0] signed, in nm
pub const POS_CALC_OFFSET_Y          : u64 = 0x1c; //[31:0] signed, in nm
pub const POS_CALC_OFFSET_VAL        : u32 = 0xffff_ffff;

pub const POS_CALC_SW_TAG            : u64 = 0x20;
pub const POS_CALC_SW_TAG_EN         : u32 = 1 << 0;      // tag trigger enable, ABI minor >= 1
pub const POS_CALC_SW_TAG_EN_MIN_ABI : u8  = 1;
pub const POS_CALC_SW_DESYNC_CNT_RST : u32 = 1 << 8;      // write 1 to reset the desync counter
pub const POS_CALC_SW_DESYNC_CNT     : u32 = 0x3fff_0000; //[29:16] (ro)

pub const POS_CALC_DSP_ERR_CLR       : u64 = 0x24;
pub const POS_CALC_DSP_ERR_CLR_TBT   : u32 = 1 << 0;
pub const POS_CALC_DSP_ERR_CLR_FOFB  : u32 = 1 << 1;
pub const POS_CALC_DSP_ERR_CLR_MONIT : u32 = 1 << 2;

pub const POS_CALC_DSP_CTNR_TBT      : u64 = 0x28;
pub const POS_CALC_DSP_CTNR_CH01     : u32 = 0x0000_ffff; //[15:0] (ro)
pub const POS_CALC_DSP_CTNR_CH23     : u32 = 0xffff_0000; //[31:16] (ro)

/// per channel gains, one word each
pub const POS_CALC_CH0_GAIN          : u64 = 0x2c; //[31:0] fixed point, 16 fractional bits
pub const POS_CALC_GAIN_POINT_POS    : u32 = 16;
pub const POS_CALC_NUM_CHAN          : usize = 4;
pub const POS_CALC_REGS_WORDS        : usize = POS_CALC_CH0_GAIN as usize/4 + POS_CALC_NUM_CHAN;

/// word index of a register in the image of its core
pub const fn word(offset : u64) -> usize {
  (offset/4) as usize
}

//! Embedded real-mode BIOS code.
//!
//! Each stub is a position-independent 16-bit fragment entered through an
//! IVT descriptor of the form `{segment: base >> 4, offset: 0}`, so CS
//! covers the fragment and `cs:` disp16 references resolve to in-fragment
//! labels at any 16-byte-aligned placement. The bytes were hand-assembled
//! and are annotated with the instruction each one encodes.

/// Default handler for every vector: a bare `iret`.
pub const INTFAKE: &[u8] = &[
    0xCF, // iret
];

/// `int 10h` video services.
///
/// Teletype output (AH = 0Eh) appends AL to the VGA text stream at
/// B800:0000 through a cursor word kept after the code; the cursor wraps
/// within one 4 KiB page. Every other subfunction returns unchanged.
pub const INT10: &[u8] = &[
    0x80, 0xFC, 0x0E, //       cmp   ah, 0x0e
    0x75, 0x1D, //             jne   done
    0x0F, 0xA0, //             push  fs
    0x53, //                   push  bx
    0xBB, 0x00, 0xB8, //       mov   bx, 0xb800
    0x8E, 0xE3, //             mov   fs, bx
    0x2E, 0x8B, 0x1E, 0x23, 0x00, // mov bx, cs:[cursor]
    0x64, 0x88, 0x07, //       mov   fs:[bx], al
    0x43, //                   inc   bx
    0x81, 0xE3, 0xFF, 0x0F, // and   bx, 0x0fff
    0x2E, 0x89, 0x1E, 0x23, 0x00, // mov cs:[cursor], bx
    0x5B, //                   pop   bx
    0x0F, 0xA1, //             pop   fs
    0xCF, //           done:   iret
    0x00, 0x00, //     cursor: .word 0
];

/// `int 15h` services.
///
/// For EAX = E820h the in/out registers (ES, ECX, EBX, EDI) are pushed as
/// an on-stack frame, `e820_query_map` is called to fill in one map entry,
/// the frame is popped back, EAX is loaded with 'SMAP' and the carry flag
/// is cleared in the saved-FLAGS image. Every other function returns with
/// carry set. Padded to [`E820_QUERY_MAP_OFFSET`], where the trampoline
/// must be placed.
pub const INT15: &[u8] = &[
    0x66, 0x3D, 0x20, 0xE8, 0x00, 0x00, // cmp  eax, 0xe820
    0x75, 0x20, //             jne   unsupported
    0x55, //                   push  bp
    0x89, 0xE5, //             mov   bp, sp
    0x06, //                   push  es
    0x66, 0x51, //             push  ecx
    0x66, 0x53, //             push  ebx
    0x66, 0x57, //             push  edi
    0xE8, 0x2B, 0x00, //       call  e820_query_map
    0x66, 0x5F, //             pop   edi
    0x66, 0x5B, //             pop   ebx
    0x66, 0x59, //             pop   ecx
    0x07, //                   pop   es
    0x66, 0xB8, 0x50, 0x41, 0x4D, 0x53, // mov eax, 0x534d4150 ; 'SMAP'
    0x83, 0x66, 0x06, 0xFE, // and   word [bp+6], 0xfffe      ; clear CF
    0x5D, //                   pop   bp
    0xCF, //                   iret
    0x55, //           unsupported: push bp
    0x89, 0xE5, //             mov   bp, sp
    0x83, 0x4E, 0x06, 0x01, // or    word [bp+6], 0x0001      ; set CF
    0x5D, //                   pop   bp
    0xCF, //                   iret
    0xCC, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC, // pad to 0x40
    0xCC, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC,
];

/// `e820_query_map`: produce one memory-map entry per call.
///
/// Reads the continuation index from the EBX slot of the caller's frame,
/// copies the matching 20-byte entry from the table the monitor wrote at
/// [`E820_TABLE_OFFSET`] to ES:DI, stores ECX = 20 and the next
/// continuation (0 after the last entry) back into the frame. Indices past
/// the table just terminate the enumeration.
pub const E820_QUERY_MAP: &[u8] = &[
    0x56, //                   push  si
    0x51, //                   push  cx
    0x52, //                   push  dx
    0x1E, //                   push  ds
    0x8B, 0x5E, 0xF6, //       mov   bx, [bp-10]              ; continuation
    0x2E, 0x3B, 0x1E, 0x84, 0x00, // cmp bx, cs:[nr_entries]
    0x73, 0x27, //             jae   wrap
    0x8B, 0x7E, 0xF2, //       mov   di, [bp-14]              ; dest offset
    0x0E, //                   push  cs
    0x1F, //                   pop   ds
    0xBE, 0x86, 0x00, //       mov   si, e820_table
    0xB8, 0x14, 0x00, //       mov   ax, 20
    0xF7, 0xE3, //             mul   bx
    0x01, 0xC6, //             add   si, ax
    0xB9, 0x0A, 0x00, //       mov   cx, 10
    0xFC, //                   cld
    0xF3, 0xA5, //             rep movsw
    0xC7, 0x46, 0xFA, 0x14, 0x00, // mov word [bp-6], 20      ; ECX out, low
    0xC7, 0x46, 0xFC, 0x00, 0x00, // mov word [bp-4], 0       ; ECX out, high
    0x43, //                   inc   bx
    0x2E, 0x3B, 0x1E, 0x84, 0x00, // cmp bx, cs:[nr_entries]
    0x72, 0x02, //             jb    store
    0x31, 0xDB, //     wrap:   xor   bx, bx
    0x89, 0x5E, 0xF6, //store: mov   [bp-10], bx              ; EBX out, low
    0xC7, 0x46, 0xF8, 0x00, 0x00, // mov word [bp-8], 0       ; EBX out, high
    0x1F, //                   pop   ds
    0x5A, //                   pop   dx
    0x59, //                   pop   cx
    0x5E, //                   pop   si
    0xC3, //                   ret
];

/// Offset of the trampoline within the int15 image.
pub const E820_QUERY_MAP_OFFSET: usize = 0x40;

/// Offset of the entry-count word within the int15 image.
pub const E820_NR_ENTRIES_OFFSET: usize = 0x84;

/// Offset of the packed entry table within the int15 image.
pub const E820_TABLE_OFFSET: usize = 0x86;
